//! Execution protocol between the orchestrator and the execution agent
//!
//! The orchestrator sends one `ExecutionRequest` and reads back an ordered
//! stream of `Frame`s. A stream that ends without an `Error` or `Cancelled`
//! frame means the whole pipeline succeeded. Dropping the stream on the
//! orchestrator side cancels the execution on the agent side.

pub mod client;
pub mod local;

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::agent::pipeline::PipelineState;
use crate::errors::DeployError;
use crate::models::{DeploymentTask, TaskId};
use crate::queue::validate;
use crate::secrets::DeployEnv;

pub use client::HttpAgentClient;
pub use local::LocalAgent;

/// Pipeline stage a failure is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Clone,
    Build,
    Swap,
    Restart,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Clone => "clone",
            Stage::Build => "build",
            Stage::Swap => "swap",
            Stage::Restart => "restart",
        };
        f.write_str(s)
    }
}

/// One deployment as sent to the agent
///
/// `decrypted_env` redacts itself in `Debug`, so the request can be logged.
#[derive(Debug, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub trace_id: TaskId,
    pub app_id: String,
    pub target_name: String,
    pub repo_url: String,
    pub branch: String,
    pub build_command: String,
    pub target_port: u16,
    #[serde(default)]
    pub decrypted_env: DeployEnv,
}

impl ExecutionRequest {
    pub fn from_task(task: &DeploymentTask, decrypted_env: DeployEnv) -> Self {
        Self {
            trace_id: task.id,
            app_id: task.app_id.clone(),
            target_name: task.target_name.clone(),
            repo_url: task.repo_url.clone(),
            branch: task.branch.clone(),
            build_command: task.build_command.clone(),
            target_port: task.target_port,
            decrypted_env,
        }
    }

    /// The agent does not trust the orchestrator's validation
    pub fn validate(&self) -> Result<(), DeployError> {
        validate::validate_app_id(&self.app_id)?;
        validate::validate_target_name(&self.target_name)?;
        validate::validate_repo_url(&self.repo_url)?;
        validate::validate_branch(&self.branch)?;
        validate::validate_build_command(&self.build_command)?;
        validate::validate_port(self.target_port)?;
        Ok(())
    }
}

/// One element of the response stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    /// Subprocess output, one line per chunk
    Chunk { content: String },

    /// The pipeline entered a new state
    Stage { state: PipelineState },

    /// Terminal: a stage failed. Cleanup already happened.
    Error { stage: Stage, message: String },

    /// Terminal: the agent cancelled the pipeline. Cleanup already happened.
    Cancelled,
}

impl Frame {
    pub fn chunk(content: impl Into<String>) -> Self {
        Frame::Chunk {
            content: content.into(),
        }
    }
}

/// Response stream of one execution. Dropping it cancels the execution.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, DeployError>> + Send>>;

/// Orchestrator-side view of an execution agent
#[async_trait]
pub trait ExecutionAgent: Send + Sync {
    /// Open an execution stream for `request`
    async fn execute(&self, request: ExecutionRequest) -> Result<FrameStream, DeployError>;
}

/// Producer end of a frame stream, used by the agent pipeline
#[derive(Debug, Clone)]
pub struct FrameSink {
    tx: mpsc::Sender<Frame>,
}

impl FrameSink {
    pub fn new(tx: mpsc::Sender<Frame>) -> Self {
        Self { tx }
    }

    /// Send a frame. A vanished consumer is not an error here: the
    /// cancellation token tied to the stream takes care of teardown.
    pub async fn send(&self, frame: Frame) {
        let _ = self.tx.send(frame).await;
    }

    pub async fn chunk(&self, content: impl Into<String>) {
        self.send(Frame::chunk(content)).await;
    }

    pub async fn stage(&self, state: PipelineState) {
        self.send(Frame::Stage { state }).await;
    }
}
