//! Build step

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::agent::jail::BuildIdentity;
use crate::agent::process::{describe_exit, run_streaming};
use crate::errors::DeployError;
use crate::protocol::{FrameSink, Stage};
use crate::secrets::DeployEnv;

/// Shell the build command is handed to; absolute so no `PATH` lookup happens
const SHELL: &str = "/bin/sh";

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Everything the build step needs for one release
pub struct BuildSpec<'a> {
    pub command: &'a str,
    pub workdir: &'a Path,
    /// Unprivileged identity to run as, if any
    pub run_as: Option<&'a BuildIdentity>,
    pub env: &'a DeployEnv,
    pub port: u16,
}

#[async_trait]
pub trait BuildRunner: Send + Sync {
    async fn build(
        &self,
        spec: BuildSpec<'_>,
        sink: &FrameSink,
        cancel: &CancellationToken,
    ) -> Result<(), DeployError>;
}

/// Runs the build command through `sh -c`
#[derive(Debug, Default, Clone)]
pub struct ShellBuildRunner;

impl ShellBuildRunner {
    fn command(spec: &BuildSpec<'_>) -> Command {
        let mut cmd = Command::new(SHELL);
        cmd.args(["-c", spec.command]).current_dir(spec.workdir);

        // Credentials first, so the fixed variables always win
        cmd.env_clear()
            .envs(spec.env.exposed())
            .env("PATH", DEFAULT_PATH)
            .env("HOME", spec.workdir)
            .env("PORT", spec.port.to_string());

        // The privilege drop happens in the child before exec; as root the
        // supplementary groups are cleared as well
        if let Some(identity) = spec.run_as {
            cmd.uid(identity.uid)
                .gid(identity.gid)
                .env("USER", &identity.user)
                .env("LOGNAME", &identity.user);
        }
        cmd
    }
}

#[async_trait]
impl BuildRunner for ShellBuildRunner {
    async fn build(
        &self,
        spec: BuildSpec<'_>,
        sink: &FrameSink,
        cancel: &CancellationToken,
    ) -> Result<(), DeployError> {
        info!(
            "Building in {} as {} ({} env vars)",
            spec.workdir.display(),
            spec.run_as.map(|id| id.user.as_str()).unwrap_or("agent user"),
            spec.env.len()
        );

        let status = run_streaming(Self::command(&spec), sink, cancel).await?;
        if !status.success() {
            return Err(DeployError::execution(
                Stage::Build,
                format!("build command {}", describe_exit(&status)),
            ));
        }
        Ok(())
    }
}
