//! Data models

pub mod deployment;

pub use deployment::{new_task_id, DeploymentTask, LiveTarget, NewTask, TaskId, TaskStatus};
