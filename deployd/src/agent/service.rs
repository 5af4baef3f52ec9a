//! Service supervisor integration

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::agent::process::{describe_exit, run_streaming};
use crate::errors::DeployError;
use crate::protocol::{FrameSink, Stage};

/// Makes the supervisor pick up the release `current` points to
#[async_trait]
pub trait ServiceManager: Send + Sync {
    async fn restart(
        &self,
        target_name: &str,
        sink: &FrameSink,
        cancel: &CancellationToken,
    ) -> Result<(), DeployError>;
}

/// `systemctl restart <prefix><target>`
#[derive(Debug, Clone)]
pub struct SystemdServiceManager {
    prefix: String,
}

impl SystemdServiceManager {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn unit_name(&self, target_name: &str) -> String {
        format!("{}{}", self.prefix, target_name)
    }
}

#[async_trait]
impl ServiceManager for SystemdServiceManager {
    async fn restart(
        &self,
        target_name: &str,
        sink: &FrameSink,
        cancel: &CancellationToken,
    ) -> Result<(), DeployError> {
        let unit = self.unit_name(target_name);
        info!("Restarting {}", unit);

        let mut cmd = Command::new("systemctl");
        cmd.args(["restart", "--", &unit]);

        let status = run_streaming(cmd, sink, cancel).await?;
        if !status.success() {
            return Err(DeployError::execution(
                Stage::Restart,
                format!("systemctl restart {} {}", unit, describe_exit(&status)),
            ));
        }
        Ok(())
    }
}

/// No supervisor configured: the swap alone publishes the release
#[derive(Debug, Default, Clone)]
pub struct NoopServiceManager;

#[async_trait]
impl ServiceManager for NoopServiceManager {
    async fn restart(
        &self,
        target_name: &str,
        _sink: &FrameSink,
        _cancel: &CancellationToken,
    ) -> Result<(), DeployError> {
        debug!("No service manager configured, skipping restart of {}", target_name);
        Ok(())
    }
}
