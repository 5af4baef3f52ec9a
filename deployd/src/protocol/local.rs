//! In-process execution agent

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::debug;

use crate::agent::executor::Executor;
use crate::errors::DeployError;
use crate::protocol::{ExecutionAgent, ExecutionRequest, Frame, FrameSink, FrameStream};

/// Frames buffered between the pipeline and its consumer
const FRAME_BUFFER: usize = 256;

/// Start `request` on `executor` in the background
///
/// The returned guard cancels the execution when dropped, so tie it to the
/// lifetime of whatever consumes the receiver.
pub fn start_execution(
    executor: Arc<Executor>,
    request: ExecutionRequest,
) -> (mpsc::Receiver<Frame>, DropGuard) {
    let (tx, rx) = mpsc::channel(FRAME_BUFFER);
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    tokio::spawn(async move {
        let trace_id = request.trace_id;
        executor.run(request, FrameSink::new(tx), token).await;
        debug!("Execution {} finished", trace_id);
    });

    (rx, cancel.drop_guard())
}

/// Runs the pipeline in the orchestrator's own process
///
/// Useful for single-host setups and for tests. The privilege boundary is
/// then only as strong as the build user separation.
pub struct LocalAgent {
    executor: Arc<Executor>,
}

impl LocalAgent {
    pub fn new(executor: Arc<Executor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl ExecutionAgent for LocalAgent {
    async fn execute(&self, request: ExecutionRequest) -> Result<FrameStream, DeployError> {
        request.validate()?;
        let (rx, guard) = start_execution(self.executor.clone(), request);

        Ok(Box::pin(futures::stream::unfold(
            (rx, guard),
            |(mut rx, guard)| async move {
                let frame = rx.recv().await?;
                Some((Ok(frame), (rx, guard)))
            },
        )))
    }
}
