//! In-process task queue
//!
//! Backs tests and single-process development setups. All state lives
//! behind one mutex, so every operation is a single critical section and
//! claiming is trivially atomic.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::errors::DeployError;
use crate::models::{new_task_id, DeploymentTask, LiveTarget, NewTask, TaskId, TaskStatus};
use crate::queue::validate::validate_task;
use crate::queue::{check_finalize, TaskQueue};

#[derive(Default)]
struct Inner {
    tasks: HashMap<TaskId, DeploymentTask>,
    /// Insertion order, oldest first
    order: Vec<TaskId>,
}

/// Mutex-guarded in-memory queue
#[derive(Default)]
pub struct MemoryTaskQueue {
    inner: Mutex<Inner>,
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks currently in `status`
    pub async fn count(&self, status: TaskStatus) -> usize {
        let inner = self.inner.lock().await;
        inner.tasks.values().filter(|t| t.status == status).count()
    }

    /// Number of `claimed` tasks for one target
    pub async fn claimed_for(&self, target_name: &str) -> usize {
        let inner = self.inner.lock().await;
        inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Claimed && t.target_name == target_name)
            .count()
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn enqueue(&self, task: NewTask) -> Result<TaskId, DeployError> {
        validate_task(&task)?;

        let id = new_task_id();
        let mut inner = self.inner.lock().await;
        inner.tasks.insert(id, DeploymentTask::from_new(id, task));
        inner.order.push(id);
        debug!("Enqueued task {}", id);
        Ok(id)
    }

    async fn claim_next(&self) -> Result<Option<DeploymentTask>, DeployError> {
        let mut inner = self.inner.lock().await;

        let busy: Vec<String> = inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Claimed)
            .map(|t| t.target_name.clone())
            .collect();

        let next = inner.order.iter().copied().find(|id| {
            inner
                .tasks
                .get(id)
                .map(|t| t.status == TaskStatus::Pending && !busy.contains(&t.target_name))
                .unwrap_or(false)
        });

        let Some(id) = next else {
            return Ok(None);
        };

        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or_else(|| DeployError::Internal(format!("Task {} vanished during claim", id)))?;
        task.status = TaskStatus::Claimed;
        task.started_at = Some(Utc::now());
        Ok(Some(task.clone()))
    }

    async fn append_log(&self, id: TaskId, chunk: &str) -> Result<(), DeployError> {
        let mut inner = self.inner.lock().await;
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or_else(|| DeployError::NotFound(format!("task {}", id)))?;
        task.log.push_str(chunk);
        Ok(())
    }

    async fn finalize(&self, id: TaskId, status: TaskStatus) -> Result<(), DeployError> {
        let mut inner = self.inner.lock().await;
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or_else(|| DeployError::NotFound(format!("task {}", id)))?;

        if check_finalize(id, task.status, status)? {
            task.status = status;
            task.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn cancel_pending(&self, id: TaskId) -> Result<bool, DeployError> {
        let mut inner = self.inner.lock().await;
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or_else(|| DeployError::NotFound(format!("task {}", id)))?;

        if task.status != TaskStatus::Pending {
            return Ok(false);
        }
        task.status = TaskStatus::Cancelled;
        task.finished_at = Some(Utc::now());
        Ok(true)
    }

    async fn fail_stale_claims(
        &self,
        older_than: Duration,
        marker: &str,
    ) -> Result<Vec<TaskId>, DeployError> {
        let older_than = chrono::Duration::from_std(older_than)
            .map_err(|e| DeployError::ValidationError(format!("claim age out of range: {}", e)))?;
        let cutoff = Utc::now() - older_than;

        let mut inner = self.inner.lock().await;
        let mut failed = Vec::new();
        for task in inner.tasks.values_mut() {
            let stale = task.status == TaskStatus::Claimed
                && task.started_at.map(|at| at < cutoff).unwrap_or(true);
            if stale {
                task.status = TaskStatus::Failed;
                task.finished_at = Some(Utc::now());
                task.log.push_str(marker);
                failed.push(task.id);
            }
        }
        Ok(failed)
    }

    async fn get(&self, id: TaskId) -> Result<Option<DeploymentTask>, DeployError> {
        let inner = self.inner.lock().await;
        Ok(inner.tasks.get(&id).cloned())
    }

    async fn live_targets(&self) -> Result<Vec<LiveTarget>, DeployError> {
        let inner = self.inner.lock().await;
        let mut latest: HashMap<&str, &DeploymentTask> = HashMap::new();

        for task in inner.tasks.values() {
            if task.status != TaskStatus::Success {
                continue;
            }
            let newer = latest
                .get(task.target_name.as_str())
                .map(|seen| task.finished_at > seen.finished_at)
                .unwrap_or(true);
            if newer {
                latest.insert(task.target_name.as_str(), task);
            }
        }

        let mut targets: Vec<LiveTarget> = latest
            .into_values()
            .map(|t| LiveTarget {
                target_name: t.target_name.clone(),
                target_port: t.target_port,
            })
            .collect();
        targets.sort_by(|a, b| a.target_name.cmp(&b.target_name));
        Ok(targets)
    }
}
