//! Finite state machine for one deployment pipeline

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::DeployError;
use crate::protocol::Stage;

/// Pipeline state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    /// Request accepted, nothing touched yet
    Idle,

    /// Release directory created, repository being fetched
    Cloning,

    /// Build command running under the deployment identity
    Building,

    /// Repointing `current` at the new release
    Swapping,

    /// Asking the service supervisor to pick up the new release
    Restarting,

    Done,

    Failed,

    Cancelled,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineState::Done | PipelineState::Failed | PipelineState::Cancelled
        )
    }

    /// Stage a failure in this state is attributed to
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineState::Idle | PipelineState::Cloning => Some(Stage::Clone),
            PipelineState::Building => Some(Stage::Build),
            PipelineState::Swapping => Some(Stage::Swap),
            PipelineState::Restarting => Some(Stage::Restart),
            _ => None,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineState::Idle => "idle",
            PipelineState::Cloning => "cloning",
            PipelineState::Building => "building",
            PipelineState::Swapping => "swapping",
            PipelineState::Restarting => "restarting",
            PipelineState::Done => "done",
            PipelineState::Failed => "failed",
            PipelineState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Pipeline event
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// Begin fetching sources
    Start,

    /// Sources are in the release directory
    Cloned,

    /// Build exited successfully
    Built,

    /// `current` now points at the new release
    Swapped,

    /// Service supervisor accepted the restart
    Restarted,

    /// The current stage failed
    Fail(String),

    /// External cancellation
    Cancel,
}

/// Pipeline FSM
#[derive(Debug, Clone)]
pub struct PipelineFsm {
    state: PipelineState,
    error: Option<String>,
    failed_stage: Option<Stage>,
}

impl PipelineFsm {
    /// Create a new FSM in idle state
    pub fn new() -> Self {
        Self {
            state: PipelineState::Idle,
            error: None,
            failed_stage: None,
        }
    }

    /// Get current state
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Get error message if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Stage that failed, once in `Failed`
    pub fn failed_stage(&self) -> Option<Stage> {
        self.failed_stage
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: PipelineEvent) -> Result<PipelineState, DeployError> {
        let new_state = match (self.state, &event) {
            (PipelineState::Idle, PipelineEvent::Start) => PipelineState::Cloning,
            (PipelineState::Cloning, PipelineEvent::Cloned) => PipelineState::Building,
            (PipelineState::Building, PipelineEvent::Built) => PipelineState::Swapping,
            (PipelineState::Swapping, PipelineEvent::Swapped) => PipelineState::Restarting,
            (PipelineState::Restarting, PipelineEvent::Restarted) => PipelineState::Done,

            // Error exit from any working state
            (state, PipelineEvent::Fail(err)) if !state.is_terminal() => {
                self.error = Some(err.clone());
                self.failed_stage = state.stage();
                PipelineState::Failed
            }

            // Cancellation from any working state
            (state, PipelineEvent::Cancel) if !state.is_terminal() => PipelineState::Cancelled,

            // Invalid transitions
            (state, event) => {
                return Err(DeployError::StateError(format!(
                    "Invalid pipeline transition: {:?} -> {:?}",
                    state, event
                )));
            }
        };

        self.state = new_state;
        Ok(new_state)
    }
}

impl Default for PipelineFsm {
    fn default() -> Self {
        Self::new()
    }
}
