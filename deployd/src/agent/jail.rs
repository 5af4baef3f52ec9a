//! Per-application build identities
//!
//! When a build user prefix is configured every application gets its own
//! system user without a login shell. Its release directory is handed over
//! to that user before anything from the repository runs, and both the clone
//! and the build drop to it.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use crate::errors::DeployError;

/// Owner rwx, group r-x, others nothing
const RELEASE_MODE: u32 = 0o750;

/// An unprivileged user resolved to numeric ids
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildIdentity {
    pub user: String,
    pub uid: u32,
    pub gid: u32,
}

#[async_trait]
pub trait JailManager: Send + Sync {
    /// Create `user` unless it exists, and resolve its ids
    async fn provision(&self, user: &str) -> Result<BuildIdentity, DeployError>;

    /// Restrict `path` to mode 0750 and hand the whole tree to `identity`
    async fn secure_directory(&self, path: &Path, identity: &BuildIdentity)
        -> Result<(), DeployError>;
}

/// `useradd`/`chown` based jail for Linux hosts
#[derive(Debug, Default, Clone)]
pub struct LinuxJailManager;

#[async_trait]
impl JailManager for LinuxJailManager {
    async fn provision(&self, user: &str) -> Result<BuildIdentity, DeployError> {
        validate_user(user)?;

        if lookup_id(user, "-u").await?.is_none() {
            info!("Provisioning build user {}", user);
            let output = Command::new("useradd")
                .args(["--system", "--shell", "/bin/false", user])
                .output()
                .await?;
            if !output.status.success() {
                return Err(DeployError::Internal(format!(
                    "useradd {} failed: {}",
                    user,
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
        }

        let uid = lookup_id(user, "-u").await?;
        let gid = lookup_id(user, "-g").await?;
        match (uid, gid) {
            (Some(uid), Some(gid)) => Ok(BuildIdentity {
                user: user.to_string(),
                uid,
                gid,
            }),
            _ => Err(DeployError::Internal(format!(
                "build user {} cannot be resolved",
                user
            ))),
        }
    }

    async fn secure_directory(
        &self,
        path: &Path,
        identity: &BuildIdentity,
    ) -> Result<(), DeployError> {
        let mut perms = tokio::fs::metadata(path).await?.permissions();
        perms.set_mode(RELEASE_MODE);
        tokio::fs::set_permissions(path, perms).await?;

        // Symlinks shipped by the repository are changed themselves, never followed
        let output = Command::new("chown")
            .args(["-R", "-P", "-h", "--"])
            .arg(format!("{}:{}", identity.uid, identity.gid))
            .arg(path)
            .output()
            .await?;
        if !output.status.success() {
            return Err(DeployError::Internal(format!(
                "chown of {} failed: {}",
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

/// Derive the build user for `app_id`; names are limited to `[A-Za-z0-9-]`
pub fn build_user(prefix: &str, app_id: &str) -> Result<String, DeployError> {
    let user = format!("{}{}", prefix, app_id);
    validate_user(&user)?;
    Ok(user)
}

fn validate_user(user: &str) -> Result<(), DeployError> {
    let valid = !user.is_empty()
        && user.len() <= 32
        && !user.starts_with('-')
        && user.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
    if !valid {
        return Err(DeployError::ValidationError(format!(
            "Invalid build user '{}'",
            user
        )));
    }
    Ok(())
}

/// `id -u`/`id -g` of `user`, or `None` if it does not exist
async fn lookup_id(user: &str, flag: &str) -> Result<Option<u32>, DeployError> {
    let output = Command::new("id").args([flag, "--", user]).output().await?;
    if !output.status.success() {
        return Ok(None);
    }
    let id = String::from_utf8_lossy(&output.stdout)
        .trim()
        .parse::<u32>()
        .map_err(|e| DeployError::Internal(format!("unexpected id output for {}: {}", user, e)))?;
    Ok(Some(id))
}
