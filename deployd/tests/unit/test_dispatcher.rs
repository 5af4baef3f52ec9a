//! Dispatcher tests: queue, codec, relay and an in-process agent end to end

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use deployd::agent::build::ShellBuildRunner;
use deployd::agent::git::SourceFetcher;
use deployd::agent::jail::BuildIdentity;
use deployd::agent::pipeline::PipelineState;
use deployd::agent::service::NoopServiceManager;
use deployd::agent::{AgentOptions, Executor};
use deployd::errors::DeployError;
use deployd::models::{NewTask, TaskId, TaskStatus};
use deployd::protocol::{
    ExecutionAgent, ExecutionRequest, Frame, FrameSink, FrameStream, LocalAgent,
};
use deployd::queue::{MemoryTaskQueue, TaskQueue};
use deployd::secrets::{DeployEnv, SecretCodec};
use deployd::telemetry::{RelayEvent, TelemetryRelay};
use deployd::workers::dispatcher::{Dispatcher, Options};

const KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

/// Serves `build.sh` with the given content to every release
struct ScriptFetcher {
    script: String,
}

#[async_trait]
impl SourceFetcher for ScriptFetcher {
    async fn fetch(
        &self,
        _repo_url: &str,
        _branch: &str,
        dest: &Path,
        _run_as: Option<&BuildIdentity>,
        _sink: &FrameSink,
        _cancel: &CancellationToken,
    ) -> Result<(), DeployError> {
        tokio::fs::write(dest.join("build.sh"), &self.script).await?;
        Ok(())
    }
}

struct UnreachableAgent;

#[async_trait]
impl ExecutionAgent for UnreachableAgent {
    async fn execute(&self, _request: ExecutionRequest) -> Result<FrameStream, DeployError> {
        Err(DeployError::TransportError("agent unreachable: connection refused".into()))
    }
}

/// Replays a fixed frame sequence, then ends the stream
struct ReplayAgent {
    frames: Vec<Frame>,
}

#[async_trait]
impl ExecutionAgent for ReplayAgent {
    async fn execute(&self, _request: ExecutionRequest) -> Result<FrameStream, DeployError> {
        let frames = self.frames.clone();
        Ok(Box::pin(futures::stream::iter(frames.into_iter().map(Ok))))
    }
}

struct Harness {
    queue: Arc<MemoryTaskQueue>,
    codec: Arc<SecretCodec>,
    relay: Arc<TelemetryRelay>,
    dispatcher: Arc<Dispatcher>,
    executor: Arc<Executor>,
    _root: tempfile::TempDir,
}

fn harness(script: &str, options: Options) -> Harness {
    let root = tempfile::tempdir().unwrap();
    let executor = Arc::new(Executor::new(
        AgentOptions {
            web_root: root.path().to_path_buf(),
            retention: 3,
            ..Default::default()
        },
        Arc::new(ScriptFetcher {
            script: script.to_string(),
        }),
        Arc::new(ShellBuildRunner),
        Arc::new(NoopServiceManager),
    ));
    harness_with_agent(Arc::new(LocalAgent::new(executor.clone())), executor, root, options)
}

fn harness_with_agent(
    agent: Arc<dyn ExecutionAgent>,
    executor: Arc<Executor>,
    root: tempfile::TempDir,
    options: Options,
) -> Harness {
    let queue = Arc::new(MemoryTaskQueue::new());
    let codec = Arc::new(SecretCodec::from_hex_key(KEY).unwrap());
    let relay = Arc::new(TelemetryRelay::new(1_000));
    let dispatcher = Arc::new(Dispatcher::new(
        options,
        queue.clone(),
        codec.clone(),
        agent,
        relay.clone(),
    ));
    Harness {
        queue,
        codec,
        relay,
        dispatcher,
        executor,
        _root: root,
    }
}

fn new_task(target: &str) -> NewTask {
    NewTask {
        app_id: "app-1".to_string(),
        target_name: target.to_string(),
        repo_url: "https://example.com/shop.git".to_string(),
        branch: "main".to_string(),
        build_command: "sh build.sh".to_string(),
        target_port: 3000,
        encrypted_credentials: None,
    }
}

/// Dispatch everything claimable and wait for it to finish
async fn dispatch_all(h: &Harness) -> Vec<TaskStatus> {
    let mut running = JoinSet::new();
    h.dispatcher
        .dispatch_ready(&mut running, &CancellationToken::new())
        .await;
    let mut statuses = Vec::new();
    while let Some(status) = running.join_next().await {
        statuses.push(status.unwrap());
    }
    statuses
}

async fn log_of(h: &Harness, id: TaskId) -> String {
    h.queue.get(id).await.unwrap().unwrap().log
}

#[tokio::test]
async fn test_failing_build_scenario() {
    let h = harness("echo one\necho two\necho three\nexit 1\n", Options::default());
    let id = h.queue.enqueue(new_task("shop")).await.unwrap();
    let mut observer = h.relay.subscribe(id);

    assert_eq!(dispatch_all(&h).await, vec![TaskStatus::Failed]);

    let task = h.queue.get(id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.finished_at.is_some());
    assert_eq!(
        task.log,
        "one\ntwo\nthree\ndeployment failed: build stage: build command exited with status 1\n"
    );

    let layout = h.executor.layout("shop");
    assert!(layout.releases().await.unwrap().is_empty());
    assert!(layout.current_release().await.unwrap().is_none());

    // Observers see the marker, then the end of the channel
    let mut seen = Vec::new();
    loop {
        match observer.recv().await {
            RelayEvent::Chunk(chunk) => seen.push(chunk),
            RelayEvent::End => break,
        }
    }
    assert_eq!(
        seen.last().map(String::as_str),
        Some("deployment failed: build stage: build command exited with status 1\n")
    );
    assert!(seen.contains(&"==> building\n".to_string()));
    assert!(seen.contains(&"three\n".to_string()));
}

#[tokio::test]
async fn test_success_scenario() {
    let h = harness("echo built\n", Options::default());
    let first = h.queue.enqueue(new_task("shop")).await.unwrap();
    assert_eq!(dispatch_all(&h).await, vec![TaskStatus::Success]);

    for _ in 0..4 {
        h.queue.enqueue(new_task("shop")).await.unwrap();
        assert_eq!(dispatch_all(&h).await, vec![TaskStatus::Success]);
    }

    assert_eq!(log_of(&h, first).await, "built\ndeployment succeeded\n");
    let layout = h.executor.layout("shop");
    let releases = layout.releases().await.unwrap();
    assert!(releases.len() <= 3);
    assert_eq!(
        layout.current_release().await.unwrap().as_ref(),
        releases.last()
    );
    assert_eq!(h.queue.live_targets().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_credentials_are_decrypted_for_the_owning_app() {
    let h = harness("echo \"mode=$MODE\"\n", Options::default());
    let mut env = DeployEnv::new();
    env.insert("MODE", "production".to_string()).unwrap();

    let mut task = new_task("shop");
    task.encrypted_credentials = Some(h.codec.encrypt_env(&env, "app-1").unwrap());
    let id = h.queue.enqueue(task).await.unwrap();

    assert_eq!(dispatch_all(&h).await, vec![TaskStatus::Success]);
    assert!(log_of(&h, id).await.starts_with("mode=production\n"));
}

#[tokio::test]
async fn test_credentials_of_another_app_fail_the_task() {
    let h = harness("true\n", Options::default());
    let mut env = DeployEnv::new();
    env.insert("MODE", "production".to_string()).unwrap();

    let mut task = new_task("shop");
    task.encrypted_credentials = Some(h.codec.encrypt_env(&env, "app-2").unwrap());
    let id = h.queue.enqueue(task).await.unwrap();

    assert_eq!(dispatch_all(&h).await, vec![TaskStatus::Failed]);
    let log = log_of(&h, id).await;
    assert!(log.starts_with("deployment failed: Integrity error"), "{}", log);
    assert!(!log.contains("production"));
    // The agent was never asked to build
    assert!(h.executor.layout("shop").releases().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unreachable_agent_fails_the_task() {
    let root = tempfile::tempdir().unwrap();
    let executor = Arc::new(Executor::from_options(AgentOptions {
        web_root: root.path().to_path_buf(),
        ..Default::default()
    }));
    let h = harness_with_agent(Arc::new(UnreachableAgent), executor, root, Options::default());
    let id = h.queue.enqueue(new_task("shop")).await.unwrap();

    assert_eq!(dispatch_all(&h).await, vec![TaskStatus::Failed]);
    assert!(log_of(&h, id).await.contains("agent unreachable"));
}

fn replay_harness(frames: Vec<Frame>, options: Options) -> Harness {
    let root = tempfile::tempdir().unwrap();
    let executor = Arc::new(Executor::from_options(AgentOptions {
        web_root: root.path().to_path_buf(),
        ..Default::default()
    }));
    harness_with_agent(Arc::new(ReplayAgent { frames }), executor, root, options)
}

#[tokio::test]
async fn test_stream_ending_before_done_fails_the_task() {
    let h = replay_harness(
        vec![
            Frame::Stage {
                state: PipelineState::Cloning,
            },
            Frame::Chunk {
                content: "partial\n".to_string(),
            },
            Frame::Stage {
                state: PipelineState::Building,
            },
        ],
        Options::default(),
    );
    let id = h.queue.enqueue(new_task("shop")).await.unwrap();

    assert_eq!(dispatch_all(&h).await, vec![TaskStatus::Failed]);
    let log = log_of(&h, id).await;
    assert!(log.starts_with("partial\ndeployment failed"), "{}", log);
    assert!(log.contains("agent stream ended before completion"), "{}", log);
    assert!(h.queue.live_targets().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_stream_ending_after_done_succeeds() {
    let h = replay_harness(
        vec![
            Frame::Stage {
                state: PipelineState::Swapping,
            },
            Frame::Stage {
                state: PipelineState::Done,
            },
        ],
        Options::default(),
    );
    let id = h.queue.enqueue(new_task("shop")).await.unwrap();

    assert_eq!(dispatch_all(&h).await, vec![TaskStatus::Success]);
    assert_eq!(log_of(&h, id).await, "deployment succeeded\n");
}

#[tokio::test]
async fn test_abandoned_claims_are_failed_at_startup() {
    let options = Options {
        max_duration: Duration::from_millis(50),
        ..Default::default()
    };
    let h = harness("true\n", options);
    let abandoned = h.queue.enqueue(new_task("shop")).await.unwrap();
    h.queue.claim_next().await.unwrap().unwrap();
    let waiting = h.queue.enqueue(new_task("shop")).await.unwrap();

    // The claim holds the target until it is recovered
    assert!(h.queue.claim_next().await.unwrap().is_none());
    tokio::time::sleep(Duration::from_millis(100)).await;
    let fresh = h.queue.enqueue(new_task("blog")).await.unwrap();
    h.queue.claim_next().await.unwrap().unwrap();

    assert_eq!(h.dispatcher.recover_abandoned().await, 1);

    let task = h.queue.get(abandoned).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.finished_at.is_some());
    assert_eq!(
        task.log,
        "deployment failed: abandoned claim older than 50ms\n"
    );
    assert_eq!(
        h.queue.get(fresh).await.unwrap().unwrap().status,
        TaskStatus::Claimed
    );

    let next = h.queue.claim_next().await.unwrap().unwrap();
    assert_eq!(next.id, waiting);
}

#[tokio::test]
async fn test_pool_bounds_concurrent_deployments() {
    let options = Options {
        pool_size: 2,
        ..Default::default()
    };
    let h = harness("sleep 30\n", options);
    for i in 0..5 {
        h.queue.enqueue(new_task(&format!("site{}", i))).await.unwrap();
    }

    let cancel = CancellationToken::new();
    let mut running = JoinSet::new();
    assert_eq!(h.dispatcher.dispatch_ready(&mut running, &cancel).await, 2);
    assert_eq!(h.dispatcher.available_slots(), 0);
    assert_eq!(h.queue.count(TaskStatus::Claimed).await, 2);
    assert_eq!(h.queue.count(TaskStatus::Pending).await, 3);

    // Saturated: nothing more is claimed
    assert_eq!(h.dispatcher.dispatch_ready(&mut running, &cancel).await, 0);
    assert_eq!(h.queue.count(TaskStatus::Pending).await, 3);

    cancel.cancel();
    while let Some(status) = running.join_next().await {
        assert_eq!(status.unwrap(), TaskStatus::Cancelled);
    }
    assert_eq!(h.dispatcher.available_slots(), 2);
    assert_eq!(h.queue.count(TaskStatus::Cancelled).await, 2);
}

#[tokio::test]
async fn test_deployment_timeout_fails_the_task() {
    let options = Options {
        max_duration: Duration::from_millis(300),
        ..Default::default()
    };
    let h = harness("echo waiting\nsleep 30\n", options);
    let id = h.queue.enqueue(new_task("shop")).await.unwrap();

    let started = std::time::Instant::now();
    assert_eq!(dispatch_all(&h).await, vec![TaskStatus::Failed]);
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(log_of(&h, id)
        .await
        .ends_with("deployment timed out after 300ms\n"));
}

#[tokio::test]
async fn test_run_loop_dispatches_until_shutdown() {
    let options = Options {
        interval: Duration::from_millis(20),
        ..Default::default()
    };
    let h = harness("echo hi\n", options);
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

    let worker = tokio::spawn(h.dispatcher.clone().run(
        tokio::time::sleep,
        Box::pin(async move {
            let _ = stop_rx.await;
        }),
    ));

    let id = h.queue.enqueue(new_task("shop")).await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let status = h.queue.get(id).await.unwrap().unwrap().status;
        if status.is_terminal() {
            assert_eq!(status, TaskStatus::Success);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "deployment never finished");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    stop_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), worker)
        .await
        .unwrap()
        .unwrap();
}
