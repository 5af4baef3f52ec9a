//! Deployment pipeline executor
//!
//! Drives one `ExecutionRequest` through clone, build, swap and restart,
//! reporting progress as frames. Every failure or cancellation before the
//! swap removes the half-built release before the terminal frame is sent,
//! so the consumer never observes a stream end with debris left behind.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::agent::build::{BuildRunner, BuildSpec, ShellBuildRunner};
use crate::agent::git::{GitFetcher, SourceFetcher};
use crate::agent::jail::{build_user, BuildIdentity, JailManager, LinuxJailManager};
use crate::agent::options::AgentOptions;
use crate::agent::pipeline::{PipelineEvent, PipelineFsm};
use crate::agent::release::TargetLayout;
use crate::agent::service::{NoopServiceManager, ServiceManager, SystemdServiceManager};
use crate::errors::DeployError;
use crate::protocol::{ExecutionRequest, Frame, FrameSink, Stage};

/// Pipeline executor
pub struct Executor {
    options: AgentOptions,
    fetcher: Arc<dyn SourceFetcher>,
    builder: Arc<dyn BuildRunner>,
    services: Arc<dyn ServiceManager>,
    jail: Arc<dyn JailManager>,
}

/// Progress of one run that cleanup depends on
#[derive(Default)]
struct RunState {
    release: Option<PathBuf>,
    swapped: bool,
}

impl Executor {
    pub fn new(
        options: AgentOptions,
        fetcher: Arc<dyn SourceFetcher>,
        builder: Arc<dyn BuildRunner>,
        services: Arc<dyn ServiceManager>,
    ) -> Self {
        Self {
            options,
            fetcher,
            builder,
            services,
            jail: Arc::new(LinuxJailManager),
        }
    }

    /// Replace the jail used when a build user prefix is configured
    pub fn with_jail(mut self, jail: Arc<dyn JailManager>) -> Self {
        self.jail = jail;
        self
    }

    /// Executor with git, `sh -c` builds and systemd (when a prefix is set)
    pub fn from_options(options: AgentOptions) -> Self {
        let services: Arc<dyn ServiceManager> = match &options.service_prefix {
            Some(prefix) => Arc::new(SystemdServiceManager::new(prefix.clone())),
            None => Arc::new(NoopServiceManager),
        };
        Self::new(
            options,
            Arc::new(GitFetcher),
            Arc::new(ShellBuildRunner),
            services,
        )
    }

    pub fn options(&self) -> &AgentOptions {
        &self.options
    }

    pub fn layout(&self, target_name: &str) -> TargetLayout {
        TargetLayout::new(&self.options.web_root, target_name)
    }

    /// Run the pipeline to a terminal frame
    ///
    /// Success is reported as a final `Stage { Done }` frame; anything else
    /// ends with an `Error` or `Cancelled` frame.
    pub async fn run(&self, request: ExecutionRequest, sink: FrameSink, cancel: CancellationToken) {
        info!(
            "Executing {} for {} ({} @ {})",
            request.trace_id, request.target_name, request.repo_url, request.branch
        );

        let layout = self.layout(&request.target_name);
        let mut fsm = PipelineFsm::new();
        let mut state = RunState::default();

        let outcome = self
            .drive(&request, &layout, &mut fsm, &mut state, &sink, &cancel)
            .await;

        match outcome {
            Ok(()) => {
                info!("Execution {} done", request.trace_id);
                self.prune(&layout).await;
            }
            Err(DeployError::Cancelled(reason)) => {
                warn!("Execution {} cancelled: {}", request.trace_id, reason);
                let _ = fsm.process(PipelineEvent::Cancel);
                if !state.swapped {
                    self.discard(&layout, state.release.as_deref()).await;
                }
                sink.send(Frame::Cancelled).await;
            }
            Err(e) => {
                let (stage, message) = match e {
                    DeployError::ExecutionError { stage, message } => (stage, message),
                    other => (
                        fsm.state().stage().unwrap_or(Stage::Clone),
                        other.to_string(),
                    ),
                };
                error!(
                    "Execution {} failed at {}: {}",
                    request.trace_id, stage, message
                );
                let _ = fsm.process(PipelineEvent::Fail(message.clone()));

                if state.swapped {
                    // The new release is live; only the restart failed
                    self.prune(&layout).await;
                } else {
                    self.discard(&layout, state.release.as_deref()).await;
                }
                sink.send(Frame::Error { stage, message }).await;
            }
        }
    }

    async fn drive(
        &self,
        request: &ExecutionRequest,
        layout: &TargetLayout,
        fsm: &mut PipelineFsm,
        state: &mut RunState,
        sink: &FrameSink,
        cancel: &CancellationToken,
    ) -> Result<(), DeployError> {
        advance(fsm, PipelineEvent::Start, sink).await?;
        let release = layout.create_release().await?;
        state.release = Some(release.clone());

        // The release belongs to the build user before any repository content lands
        let identity = self.prepare_identity(&request.app_id, &release).await?;
        self.fetcher
            .fetch(
                &request.repo_url,
                &request.branch,
                &release,
                identity.as_ref(),
                sink,
                cancel,
            )
            .await?;
        advance(fsm, PipelineEvent::Cloned, sink).await?;

        // Covers fetchers that wrote as the agent
        if let Some(identity) = &identity {
            self.jail.secure_directory(&release, identity).await?;
        }
        let spec = BuildSpec {
            command: &request.build_command,
            workdir: &release,
            run_as: identity.as_ref(),
            env: &request.decrypted_env,
            port: request.target_port,
        };
        self.builder.build(spec, sink, cancel).await?;
        advance(fsm, PipelineEvent::Built, sink).await?;

        // Last point where cancellation leaves `current` untouched
        if cancel.is_cancelled() {
            return Err(DeployError::Cancelled("cancelled before swap".into()));
        }
        layout
            .swap_current(&release)
            .await
            .map_err(|e| DeployError::execution(Stage::Swap, e.to_string()))?;
        state.swapped = true;
        advance(fsm, PipelineEvent::Swapped, sink).await?;

        self.services
            .restart(&request.target_name, sink, cancel)
            .await?;
        advance(fsm, PipelineEvent::Restarted, sink).await?;
        Ok(())
    }

    async fn prepare_identity(
        &self,
        app_id: &str,
        release: &Path,
    ) -> Result<Option<BuildIdentity>, DeployError> {
        let Some(prefix) = &self.options.build_user_prefix else {
            return Ok(None);
        };
        let user = build_user(prefix, app_id)?;
        let identity = self.jail.provision(&user).await?;
        self.jail.secure_directory(release, &identity).await?;
        Ok(Some(identity))
    }

    async fn discard(&self, layout: &TargetLayout, release: Option<&Path>) {
        let Some(release) = release else { return };
        if let Err(e) = layout.remove_release(release).await {
            error!("Failed to remove release {}: {}", release.display(), e);
        }
    }

    async fn prune(&self, layout: &TargetLayout) {
        if let Err(e) = layout.prune(self.options.retention).await {
            warn!("Failed to prune releases of {}: {}", layout.base().display(), e);
        }
    }
}

async fn advance(
    fsm: &mut PipelineFsm,
    event: PipelineEvent,
    sink: &FrameSink,
) -> Result<(), DeployError> {
    let state = fsm.process(event)?;
    sink.stage(state).await;
    Ok(())
}
