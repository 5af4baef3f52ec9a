//! Dispatcher worker
//!
//! Claims pending tasks, hands each to the execution agent and pumps the
//! returned frame stream into the durable log and the telemetry relay. The
//! pool is bounded by a semaphore: a permit is taken before a task is
//! claimed, so a saturated pool never claims work it cannot start.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::pipeline::PipelineState;
use crate::errors::DeployError;
use crate::models::{DeploymentTask, TaskId, TaskStatus};
use crate::protocol::{ExecutionAgent, ExecutionRequest, Frame, Stage};
use crate::queue::TaskQueue;
use crate::secrets::{DeployEnv, SecretCodec};
use crate::telemetry::TelemetryRelay;

/// Dispatcher worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Polling interval
    pub interval: Duration,

    /// Deployments running at once
    pub pool_size: usize,

    /// Hard limit for one deployment, after which it is cancelled
    pub max_duration: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            pool_size: 4,
            max_duration: Duration::from_secs(30 * 60),
        }
    }
}

/// Terminal status plus the marker line written for it
#[derive(Debug)]
struct Outcome {
    status: TaskStatus,
    marker: String,
}

impl Outcome {
    fn success() -> Self {
        Self {
            status: TaskStatus::Success,
            marker: "deployment succeeded".to_string(),
        }
    }

    fn failed(reason: impl std::fmt::Display) -> Self {
        Self {
            status: TaskStatus::Failed,
            marker: format!("deployment failed: {}", reason),
        }
    }

    fn cancelled() -> Self {
        Self {
            status: TaskStatus::Cancelled,
            marker: "deployment cancelled".to_string(),
        }
    }
}

impl From<Result<(), DeployError>> for Outcome {
    fn from(result: Result<(), DeployError>) -> Self {
        match result {
            Ok(()) => Self::success(),
            Err(DeployError::Cancelled(_)) => Self::cancelled(),
            Err(DeployError::TimedOut(after)) => Self {
                status: TaskStatus::Failed,
                marker: format!("deployment timed out after {}", after),
            },
            Err(DeployError::ExecutionError {
                stage: Stage::Restart,
                message,
            }) => Self::failed(format!(
                "release is live, service restart failed: {}",
                message
            )),
            Err(DeployError::ExecutionError { stage, message }) => {
                Self::failed(format!("{} stage: {}", stage, message))
            }
            Err(e) => Self::failed(e),
        }
    }
}

/// Bounded pool of in-flight deployments
pub struct Dispatcher {
    queue: Arc<dyn TaskQueue>,
    codec: Arc<SecretCodec>,
    agent: Arc<dyn ExecutionAgent>,
    relay: Arc<TelemetryRelay>,
    permits: Arc<Semaphore>,
    options: Options,
}

impl Dispatcher {
    pub fn new(
        options: Options,
        queue: Arc<dyn TaskQueue>,
        codec: Arc<SecretCodec>,
        agent: Arc<dyn ExecutionAgent>,
        relay: Arc<TelemetryRelay>,
    ) -> Self {
        let pool_size = options.pool_size.max(1);
        Self {
            queue,
            codec,
            agent,
            relay,
            permits: Arc::new(Semaphore::new(pool_size)),
            options,
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Pool slots not currently running a deployment
    pub fn available_slots(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run the dispatcher worker until `shutdown_signal` resolves
    ///
    /// On shutdown every in-flight deployment is cancelled and awaited, so
    /// each one is finalized before this returns.
    pub async fn run<S, F>(
        self: Arc<Self>,
        sleep_fn: S,
        mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
    ) where
        S: Fn(Duration) -> F,
        F: Future<Output = ()>,
    {
        info!(
            "Dispatcher worker starting (pool size {})...",
            self.options.pool_size
        );

        self.recover_abandoned().await;

        let cancel = CancellationToken::new();
        let mut running = JoinSet::new();

        loop {
            self.dispatch_ready(&mut running, &cancel).await;

            while let Some(joined) = running.try_join_next() {
                if let Err(e) = joined {
                    error!("Deployment task panicked: {}", e);
                }
            }

            tokio::select! {
                _ = &mut shutdown_signal => {
                    info!("Dispatcher worker shutting down...");
                    break;
                }
                _ = sleep_fn(self.options.interval) => {
                    // Continue with next poll
                }
            }
        }

        if !running.is_empty() {
            info!("Cancelling {} in-flight deployments", running.len());
        }
        cancel.cancel();
        while let Some(joined) = running.join_next().await {
            if let Err(e) = joined {
                error!("Deployment task panicked: {}", e);
            }
        }
    }

    /// Fail claims left behind by a dispatcher that died mid-deployment
    ///
    /// A claim older than the maximum deployment duration cannot belong to
    /// a live deployment. Failing it frees its target for the next task.
    pub async fn recover_abandoned(&self) -> usize {
        let marker = format!(
            "deployment failed: abandoned claim older than {:?}\n",
            self.options.max_duration
        );
        match self
            .queue
            .fail_stale_claims(self.options.max_duration, &marker)
            .await
        {
            Ok(ids) => {
                for id in &ids {
                    warn!("Deployment {}: abandoned claim failed", id);
                }
                ids.len()
            }
            Err(e) => {
                error!("Failed to recover abandoned claims: {}", e);
                0
            }
        }
    }

    /// Claim and start tasks while pool slots are free
    ///
    /// Returns how many deployments were started.
    pub async fn dispatch_ready(
        self: &Arc<Self>,
        running: &mut JoinSet<TaskStatus>,
        cancel: &CancellationToken,
    ) -> usize {
        let mut started = 0;
        loop {
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                debug!("Worker pool saturated");
                break;
            };

            let task = match self.queue.claim_next().await {
                Ok(Some(task)) => task,
                Ok(None) => break,
                Err(e) => {
                    error!("Failed to claim next task: {}", e);
                    break;
                }
            };

            info!("Claimed deployment {} for {}", task.id, task.target_name);
            let this = self.clone();
            let token = cancel.child_token();
            running.spawn(async move {
                let _permit = permit;
                this.execute(task, token).await
            });
            started += 1;
        }
        started
    }

    /// Drive one claimed task to a terminal status
    ///
    /// The terminal marker is logged and broadcast, then the task is
    /// finalized, and only then is the relay channel closed.
    pub async fn execute(&self, task: DeploymentTask, cancel: CancellationToken) -> TaskStatus {
        let id = task.id;
        self.relay.broadcast(
            id,
            &format!("deployment {} started for {}\n", id, task.target_name),
        );

        let outcome = self.pump(&task, &cancel).await;
        info!("Deployment {}: {}", id, outcome.marker);
        self.record(id, &format!("{}\n", outcome.marker)).await;

        if let Err(e) = self.queue.finalize(id, outcome.status).await {
            error!("Failed to finalize {} as {}: {}", id, outcome.status, e);
        }
        self.relay.close(id);
        outcome.status
    }

    async fn pump(&self, task: &DeploymentTask, cancel: &CancellationToken) -> Outcome {
        let env = match &task.encrypted_credentials {
            Some(ciphertext) => match self.codec.decrypt_env(ciphertext, &task.app_id) {
                Ok(env) => env,
                Err(e) => {
                    error!("Credentials of {} rejected: {}", task.id, e);
                    return Outcome::failed(e);
                }
            },
            None => DeployEnv::new(),
        };
        let request = ExecutionRequest::from_task(task, env);
        let max = self.options.max_duration;

        tokio::select! {
            result = self.follow(task.id, request) => Outcome::from(result),
            _ = cancel.cancelled() => Outcome::cancelled(),
            _ = tokio::time::sleep(max) => {
                Outcome::from(Err(DeployError::TimedOut(format!("{:?}", max))))
            }
        }
    }

    /// Relay frames until the agent reports a terminal state
    ///
    /// Dropping the future drops the stream, which cancels the agent side.
    async fn follow(&self, id: TaskId, request: ExecutionRequest) -> Result<(), DeployError> {
        let mut stream = self.agent.execute(request).await?;
        let mut done = false;

        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Frame::Chunk { content }) => self.record(id, &content).await,
                Ok(Frame::Stage { state }) => {
                    done = state == PipelineState::Done;
                    self.relay.broadcast(id, &format!("==> {}\n", state));
                }
                Ok(Frame::Error { stage, message }) => {
                    return Err(DeployError::execution(stage, message));
                }
                Ok(Frame::Cancelled) => {
                    return Err(DeployError::Cancelled("cancelled by agent".into()));
                }
                Err(e) => {
                    warn!("Stream of {} interrupted: {}", id, e);
                    return Err(e);
                }
            }
        }

        if done {
            Ok(())
        } else {
            Err(DeployError::TransportError(
                "agent stream ended before completion".into(),
            ))
        }
    }

    /// Persist a chunk, then broadcast it. A failed write is a warning only.
    async fn record(&self, id: TaskId, chunk: &str) {
        if let Err(e) = self.queue.append_log(id, chunk).await {
            warn!("Failed to append log of {}: {}", id, e);
        }
        self.relay.broadcast(id, chunk);
    }
}
