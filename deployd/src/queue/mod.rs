//! Durable deployment task queue
//!
//! The queue owns the task lifecycle columns: status transitions, the
//! append-only log and the timestamps. Claiming is atomic in every
//! implementation and never hands the same task to two callers.

pub mod memory;
pub mod postgres;
pub mod validate;

use std::time::Duration;

use async_trait::async_trait;

use crate::errors::DeployError;
use crate::models::{DeploymentTask, LiveTarget, NewTask, TaskId, TaskStatus};

pub use memory::MemoryTaskQueue;
pub use postgres::PgTaskQueue;

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Validate and persist a new `pending` task, returning its id
    async fn enqueue(&self, task: NewTask) -> Result<TaskId, DeployError>;

    /// Atomically move the oldest claimable `pending` task to `claimed`.
    ///
    /// A task is claimable when no other task for the same target is
    /// currently `claimed`. Returns `None` when nothing is claimable.
    async fn claim_next(&self) -> Result<Option<DeploymentTask>, DeployError>;

    /// Append a chunk to the task's durable log
    async fn append_log(&self, id: TaskId, chunk: &str) -> Result<(), DeployError>;

    /// Move a task to a terminal status.
    ///
    /// Repeating the current terminal status is a no-op; anything else that
    /// is not a legal transition is a `StateError`.
    async fn finalize(&self, id: TaskId, status: TaskStatus) -> Result<(), DeployError>;

    /// Cancel a task that has not been claimed yet.
    ///
    /// Returns `false` when the task exists but is no longer `pending`.
    async fn cancel_pending(&self, id: TaskId) -> Result<bool, DeployError>;

    /// Fail every task that has been `claimed` for longer than `older_than`,
    /// appending `marker` to its log. Returns the ids that were failed.
    ///
    /// Used at dispatcher startup: no live deployment outlasts the maximum
    /// deployment duration, so older claims belong to a dispatcher that died.
    async fn fail_stale_claims(
        &self,
        older_than: Duration,
        marker: &str,
    ) -> Result<Vec<TaskId>, DeployError>;

    /// Fetch one task
    async fn get(&self, id: TaskId) -> Result<Option<DeploymentTask>, DeployError>;

    /// Targets with at least one successful deployment, carrying the port of
    /// the latest one. A failed build never replaces a live release.
    async fn live_targets(&self) -> Result<Vec<LiveTarget>, DeployError>;
}

/// Shared finalize rule: `Ok(true)` to apply, `Ok(false)` for an idempotent repeat
pub(crate) fn check_finalize(
    id: TaskId,
    current: TaskStatus,
    next: TaskStatus,
) -> Result<bool, DeployError> {
    if !next.is_terminal() {
        return Err(DeployError::StateError(format!(
            "Task {}: {} is not a terminal status",
            id, next
        )));
    }
    if current == next {
        return Ok(false);
    }
    if current.can_transition_to(next) {
        return Ok(true);
    }
    Err(DeployError::StateError(format!(
        "Task {}: invalid transition {} -> {}",
        id, current, next
    )))
}
