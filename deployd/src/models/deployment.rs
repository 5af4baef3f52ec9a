//! Deployment task models

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::DeployError;

/// Task identifier. Doubles as the trace id for telemetry correlation.
pub type TaskId = Uuid;

/// Generate a new task id.
///
/// UUIDv7 carries a millisecond timestamp plus random bits and is monotonic
/// within the process, so ids issued in the same instant never collide and
/// still sort by creation time.
pub fn new_task_id() -> TaskId {
    Uuid::now_v7()
}

/// Status of a deployment task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting for a dispatcher to claim it
    Pending,

    /// Owned by exactly one dispatcher worker
    Claimed,

    Success,

    Failed,

    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Claimed => "claimed",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// There is no way back to `Pending`: an abandoned claim stays abandoned.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Claimed)
                | (TaskStatus::Pending, TaskStatus::Cancelled)
                | (TaskStatus::Claimed, TaskStatus::Success)
                | (TaskStatus::Claimed, TaskStatus::Failed)
                | (TaskStatus::Claimed, TaskStatus::Cancelled)
        )
    }

    /// Statuses from which `self` may be entered
    pub fn sources(&self) -> &'static [TaskStatus] {
        match self {
            TaskStatus::Pending => &[],
            TaskStatus::Claimed => &[TaskStatus::Pending],
            TaskStatus::Success | TaskStatus::Failed => &[TaskStatus::Claimed],
            TaskStatus::Cancelled => &[TaskStatus::Pending, TaskStatus::Claimed],
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "claimed" => Ok(TaskStatus::Claimed),
            "success" => Ok(TaskStatus::Success),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(DeployError::StateError(format!("Unknown task status: {}", other))),
        }
    }
}

/// A deployment intent as submitted by the control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    /// Owning application, bound into the credential ciphertext
    pub app_id: String,

    pub target_name: String,

    pub repo_url: String,

    pub branch: String,

    pub build_command: String,

    pub target_port: u16,

    /// Ciphertext produced by the secret codec for `app_id`
    #[serde(default)]
    pub encrypted_credentials: Option<String>,
}

/// One deployment attempt
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentTask {
    pub id: TaskId,

    pub app_id: String,

    pub target_name: String,

    pub repo_url: String,

    pub branch: String,

    pub build_command: String,

    pub target_port: u16,

    #[serde(skip_serializing)]
    pub encrypted_credentials: Option<String>,

    pub status: TaskStatus,

    /// Durable copy of everything streamed for this task
    pub log: String,

    pub created_at: DateTime<Utc>,

    pub started_at: Option<DateTime<Utc>>,

    pub finished_at: Option<DateTime<Utc>>,
}

impl DeploymentTask {
    /// Build a pending task from an intent
    pub fn from_new(id: TaskId, task: NewTask) -> Self {
        Self {
            id,
            app_id: task.app_id,
            target_name: task.target_name,
            repo_url: task.repo_url,
            branch: task.branch,
            build_command: task.build_command,
            target_port: task.target_port,
            encrypted_credentials: task.encrypted_credentials,
            status: TaskStatus::Pending,
            log: String::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }
}

/// A target that is currently serving a successful release
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LiveTarget {
    pub target_name: String,
    pub target_port: u16,
}
