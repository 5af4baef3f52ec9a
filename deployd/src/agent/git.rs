//! Source fetching

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::agent::jail::BuildIdentity;
use crate::agent::process::{describe_exit, run_streaming};
use crate::errors::DeployError;
use crate::protocol::{FrameSink, Stage};

/// Git transports a clone may use; local paths and `file://` are never allowed
const ALLOWED_PROTOCOLS: &str = "https:ssh:git";

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Places the sources of one branch into an empty release directory
///
/// With `run_as` set the fetch runs as that identity, which already owns `dest`.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(
        &self,
        repo_url: &str,
        branch: &str,
        dest: &Path,
        run_as: Option<&BuildIdentity>,
        sink: &FrameSink,
        cancel: &CancellationToken,
    ) -> Result<(), DeployError>;
}

/// Shallow single-branch `git clone`
#[derive(Debug, Default, Clone)]
pub struct GitFetcher;

#[async_trait]
impl SourceFetcher for GitFetcher {
    async fn fetch(
        &self,
        repo_url: &str,
        branch: &str,
        dest: &Path,
        run_as: Option<&BuildIdentity>,
        sink: &FrameSink,
        cancel: &CancellationToken,
    ) -> Result<(), DeployError> {
        info!("Cloning {} (branch: {}) into {}", repo_url, branch, dest.display());

        let mut cmd = Command::new("git");
        cmd.args(["clone", "--depth", "1", "--single-branch", "--branch", branch, "--"])
            .arg(repo_url)
            .arg(dest)
            .env_clear()
            .env("PATH", DEFAULT_PATH)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_ALLOW_PROTOCOL", ALLOWED_PROTOCOLS);
        match run_as {
            Some(identity) => {
                cmd.uid(identity.uid).gid(identity.gid).env("HOME", dest);
            }
            None => {
                if let Ok(home) = std::env::var("HOME") {
                    cmd.env("HOME", home);
                }
            }
        }

        let status = run_streaming(cmd, sink, cancel).await?;
        if !status.success() {
            return Err(DeployError::execution(
                Stage::Clone,
                format!("git clone {}", describe_exit(&status)),
            ));
        }
        Ok(())
    }
}
