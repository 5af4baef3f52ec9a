//! Execution agent pipeline tests against a temporary web root

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use deployd::agent::build::ShellBuildRunner;
use deployd::agent::git::SourceFetcher;
use deployd::agent::jail::{BuildIdentity, JailManager};
use deployd::agent::pipeline::PipelineState;
use deployd::agent::release::TargetLayout;
use deployd::agent::service::{NoopServiceManager, ServiceManager};
use deployd::agent::{AgentOptions, Executor};
use deployd::errors::DeployError;
use deployd::models::new_task_id;
use deployd::protocol::local::start_execution;
use deployd::protocol::{ExecutionRequest, Frame, FrameSink, Stage};
use deployd::secrets::DeployEnv;

/// Writes `build.sh` into the release instead of cloning
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

struct MissingRepoFetcher;

#[async_trait]
impl SourceFetcher for MissingRepoFetcher {
    async fn fetch(
        &self,
        _repo_url: &str,
        _branch: &str,
        _dest: &Path,
        _run_as: Option<&BuildIdentity>,
        sink: &FrameSink,
        _cancel: &CancellationToken,
    ) -> Result<(), DeployError> {
        sink.chunk("fatal: repository not found\n").await;
        Err(DeployError::execution(Stage::Clone, "git clone exited with status 128"))
    }
}

/// Hands out the current user's ids and records every call
#[derive(Default)]
struct RecordingJail {
    calls: Mutex<Vec<String>>,
    refuse: bool,
}

impl RecordingJail {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl JailManager for RecordingJail {
    async fn provision(&self, user: &str) -> Result<BuildIdentity, DeployError> {
        self.calls.lock().unwrap().push(format!("provision {}", user));
        if self.refuse {
            return Err(DeployError::Internal(format!("useradd {} failed", user)));
        }
        let own = tempfile::tempdir()?.path().metadata()?;
        Ok(BuildIdentity {
            user: user.to_string(),
            uid: own.uid(),
            gid: own.gid(),
        })
    }

    async fn secure_directory(
        &self,
        path: &Path,
        identity: &BuildIdentity,
    ) -> Result<(), DeployError> {
        let has_script = path.join("build.sh").exists();
        self.calls.lock().unwrap().push(format!(
            "secure {} cloned={}",
            identity.user, has_script
        ));
        Ok(())
    }
}

struct FailingServiceManager;

#[async_trait]
impl ServiceManager for FailingServiceManager {
    async fn restart(
        &self,
        target_name: &str,
        _sink: &FrameSink,
        _cancel: &CancellationToken,
    ) -> Result<(), DeployError> {
        Err(DeployError::execution(
            Stage::Restart,
            format!("unit {} not found", target_name),
        ))
    }
}

fn options(web_root: &Path, retention: usize) -> AgentOptions {
    AgentOptions {
        web_root: web_root.to_path_buf(),
        retention,
        ..Default::default()
    }
}

fn executor(web_root: &Path, script: &str) -> Arc<Executor> {
    Arc::new(Executor::new(
        options(web_root, 2),
        Arc::new(ScriptFetcher {
            script: script.to_string(),
        }),
        Arc::new(ShellBuildRunner),
        Arc::new(NoopServiceManager),
    ))
}

fn request(env: DeployEnv) -> ExecutionRequest {
    ExecutionRequest {
        trace_id: new_task_id(),
        app_id: "app-1".to_string(),
        target_name: "shop".to_string(),
        repo_url: "https://example.com/shop.git".to_string(),
        branch: "main".to_string(),
        build_command: "sh build.sh".to_string(),
        target_port: 3000,
        decrypted_env: env,
    }
}

async fn run_to_end(executor: Arc<Executor>, request: ExecutionRequest) -> Vec<Frame> {
    let (mut rx, _guard) = start_execution(executor, request);
    let mut frames = Vec::new();
    while let Some(frame) = rx.recv().await {
        frames.push(frame);
    }
    frames
}

fn chunks(frames: &[Frame]) -> Vec<String> {
    frames
        .iter()
        .filter_map(|f| match f {
            Frame::Chunk { content } => Some(content.clone()),
            _ => None,
        })
        .collect()
}

async fn release_count(layout: &TargetLayout) -> usize {
    layout.releases().await.unwrap().len()
}

#[tokio::test]
async fn test_success_swaps_current_and_respects_retention() {
    let root = tempfile::tempdir().unwrap();
    let executor = executor(root.path(), "echo building\necho ok > out.txt\n");
    let layout = executor.layout("shop");

    let mut last = Vec::new();
    for _ in 0..4 {
        last = run_to_end(executor.clone(), request(DeployEnv::new())).await;
    }

    assert_eq!(
        last.last(),
        Some(&Frame::Stage {
            state: PipelineState::Done
        })
    );
    assert_eq!(chunks(&last), vec!["building\n".to_string()]);

    let current: PathBuf = layout.current_release().await.unwrap().unwrap();
    let releases = layout.releases().await.unwrap();
    assert_eq!(releases.len(), 2);
    assert_eq!(releases.last(), Some(&current));
    assert_eq!(
        tokio::fs::read_to_string(layout.current_link().join("out.txt"))
            .await
            .unwrap(),
        "ok\n"
    );
}

#[tokio::test]
async fn test_stage_frames_are_ordered() {
    let root = tempfile::tempdir().unwrap();
    let frames = run_to_end(executor(root.path(), "true\n"), request(DeployEnv::new())).await;

    let states: Vec<PipelineState> = frames
        .iter()
        .filter_map(|f| match f {
            Frame::Stage { state } => Some(*state),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            PipelineState::Cloning,
            PipelineState::Building,
            PipelineState::Swapping,
            PipelineState::Restarting,
            PipelineState::Done,
        ]
    );
}

#[tokio::test]
async fn test_failed_build_removes_release_and_keeps_current() {
    let root = tempfile::tempdir().unwrap();
    let good = executor(root.path(), "true\n");
    let layout = good.layout("shop");
    run_to_end(good, request(DeployEnv::new())).await;
    let before = layout.current_release().await.unwrap();
    assert!(before.is_some());

    let bad = executor(root.path(), "echo one\necho two\necho three\nexit 1\n");
    let frames = run_to_end(bad, request(DeployEnv::new())).await;

    assert_eq!(chunks(&frames), vec!["one\n", "two\n", "three\n"]);
    match frames.last() {
        Some(Frame::Error { stage, message }) => {
            assert_eq!(*stage, Stage::Build);
            assert!(message.contains("status 1"), "{}", message);
        }
        other => panic!("expected error frame, got {:?}", other),
    }
    assert_eq!(layout.current_release().await.unwrap(), before);
    assert_eq!(release_count(&layout).await, 1);
}

#[tokio::test]
async fn test_failed_clone_leaves_nothing_behind() {
    let root = tempfile::tempdir().unwrap();
    let executor = Arc::new(Executor::new(
        options(root.path(), 5),
        Arc::new(MissingRepoFetcher),
        Arc::new(ShellBuildRunner),
        Arc::new(NoopServiceManager),
    ));
    let layout = executor.layout("shop");

    let frames = run_to_end(executor, request(DeployEnv::new())).await;

    assert!(matches!(
        frames.last(),
        Some(Frame::Error {
            stage: Stage::Clone,
            ..
        })
    ));
    assert_eq!(chunks(&frames), vec!["fatal: repository not found\n"]);
    assert_eq!(release_count(&layout).await, 0);
    assert!(layout.current_release().await.unwrap().is_none());
}

#[tokio::test]
async fn test_restart_failure_keeps_new_release_live() {
    let root = tempfile::tempdir().unwrap();
    let executor = Arc::new(Executor::new(
        options(root.path(), 5),
        Arc::new(ScriptFetcher {
            script: "true\n".to_string(),
        }),
        Arc::new(ShellBuildRunner),
        Arc::new(FailingServiceManager),
    ));
    let layout = executor.layout("shop");

    let frames = run_to_end(executor, request(DeployEnv::new())).await;

    assert_eq!(
        frames.last(),
        Some(&Frame::Error {
            stage: Stage::Restart,
            message: "unit shop not found".to_string()
        })
    );
    let releases = layout.releases().await.unwrap();
    assert_eq!(releases.len(), 1);
    assert_eq!(layout.current_release().await.unwrap(), Some(releases[0].clone()));
}

fn jailed_executor(web_root: &Path, jail: Arc<RecordingJail>) -> Arc<Executor> {
    let jailed = AgentOptions {
        build_user_prefix: Some("app-".to_string()),
        ..options(web_root, 2)
    };
    Arc::new(
        Executor::new(
            jailed,
            Arc::new(ScriptFetcher {
                script: "id -u\n".to_string(),
            }),
            Arc::new(ShellBuildRunner),
            Arc::new(NoopServiceManager),
        )
        .with_jail(jail),
    )
}

#[tokio::test]
async fn test_release_is_handed_to_build_user_before_clone() {
    let root = tempfile::tempdir().unwrap();
    let jail = Arc::new(RecordingJail::default());
    let uid = root.path().metadata().unwrap().uid();

    let executor = jailed_executor(root.path(), jail.clone());

    let frames = run_to_end(executor, request(DeployEnv::new())).await;

    assert_eq!(
        frames.last(),
        Some(&Frame::Stage {
            state: PipelineState::Done
        })
    );
    assert_eq!(chunks(&frames), vec![format!("{}\n", uid)]);
    assert_eq!(
        jail.calls(),
        vec![
            "provision app-app-1",
            "secure app-app-1 cloned=false",
            "secure app-app-1 cloned=true",
        ]
    );
}

#[tokio::test]
async fn test_unprovisionable_user_fails_clone_stage() {
    let root = tempfile::tempdir().unwrap();
    let jail = Arc::new(RecordingJail {
        refuse: true,
        ..Default::default()
    });
    let executor = jailed_executor(root.path(), jail.clone());
    let layout = executor.layout("shop");

    let frames = run_to_end(executor, request(DeployEnv::new())).await;

    match frames.last() {
        Some(Frame::Error { stage, message }) => {
            assert_eq!(*stage, Stage::Clone);
            assert!(message.contains("useradd app-app-1 failed"), "{}", message);
        }
        other => panic!("expected error frame, got {:?}", other),
    }
    assert_eq!(jail.calls(), vec!["provision app-app-1"]);
    assert_eq!(release_count(&layout).await, 0);
}

#[tokio::test]
async fn test_credentials_reach_the_build_only() {
    let root = tempfile::tempdir().unwrap();
    let mut env = DeployEnv::new();
    env.insert("API_TOKEN", "t0k3n".to_string()).unwrap();

    let frames = run_to_end(
        executor(root.path(), "echo \"token=$API_TOKEN port=$PORT\"\n"),
        request(env),
    )
    .await;

    assert_eq!(chunks(&frames), vec!["token=t0k3n port=3000\n"]);
    assert!(std::env::var("API_TOKEN").is_err());
}

#[tokio::test]
async fn test_cancellation_kills_build_and_cleans_up() {
    let root = tempfile::tempdir().unwrap();
    let executor = executor(root.path(), "echo started\nsleep 30 &\nsleep 30\n");
    let layout = executor.layout("shop");

    let (mut rx, guard) = start_execution(executor, request(DeployEnv::new()));
    loop {
        match rx.recv().await {
            Some(Frame::Chunk { content }) if content == "started\n" => break,
            Some(_) => continue,
            None => panic!("stream ended before the build started"),
        }
    }

    let started = Instant::now();
    drop(guard);

    let mut last = None;
    while let Some(frame) = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .unwrap()
    {
        last = Some(frame);
    }

    assert_eq!(last, Some(Frame::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(release_count(&layout).await, 0);
    assert!(layout.current_release().await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_swap_is_atomic_for_concurrent_readers() {
    let root = tempfile::tempdir().unwrap();
    let layout = TargetLayout::new(root.path(), "shop");
    let a = layout.create_release().await.unwrap();
    let b = layout.create_release().await.unwrap();
    layout.swap_current(&a).await.unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let link = layout.current_link();
    let reader = {
        let stop = stop.clone();
        let (a, b) = (a.clone(), b.clone());
        std::thread::spawn(move || {
            let mut reads = 0u64;
            while reads < 1_000 || !stop.load(Ordering::Relaxed) {
                let target = std::fs::read_link(&link).expect("current vanished during swap");
                assert!(target == a || target == b);
                reads += 1;
            }
            reads
        })
    };

    for i in 0..500 {
        let next = if i % 2 == 0 { &b } else { &a };
        layout.swap_current(next).await.unwrap();
    }
    stop.store(true, Ordering::Relaxed);

    assert!(reader.join().unwrap() > 0);
    assert_eq!(layout.current_release().await.unwrap(), Some(a));
}
