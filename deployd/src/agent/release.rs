//! Release directories and the `current` pointer
//!
//! Layout under the agent's web root:
//!
//! ```text
//! <web_root>/<target>/releases/<YYYYmmddHHMMSS>-<uuid>/
//! <web_root>/<target>/current -> <web_root>/<target>/releases/<...>
//! ```
//!
//! `current` always holds the absolute path of the live release.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::DeployError;

const RELEASES_DIR: &str = "releases";
const CURRENT_LINK: &str = "current";

/// Filesystem layout of one target
#[derive(Debug, Clone)]
pub struct TargetLayout {
    base: PathBuf,
}

impl TargetLayout {
    pub fn new(web_root: &Path, target_name: &str) -> Self {
        Self {
            base: web_root.join(target_name),
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn releases_dir(&self) -> PathBuf {
        self.base.join(RELEASES_DIR)
    }

    pub fn current_link(&self) -> PathBuf {
        self.base.join(CURRENT_LINK)
    }

    /// Create a fresh, uniquely named, empty release directory
    pub async fn create_release(&self) -> Result<PathBuf, DeployError> {
        let name = format!(
            "{}-{}",
            Utc::now().format("%Y%m%d%H%M%S"),
            Uuid::now_v7().simple()
        );
        let releases = self.releases_dir();
        tokio::fs::create_dir_all(&releases).await?;

        let path = releases.join(name);
        // create_dir (not _all) fails if the name already exists
        tokio::fs::create_dir(&path).await?;
        debug!("Created release {}", path.display());
        Ok(path)
    }

    /// Remove a release directory; a missing directory is fine
    pub async fn remove_release(&self, release: &Path) -> Result<(), DeployError> {
        match tokio::fs::remove_dir_all(release).await {
            Ok(()) => {
                debug!("Removed release {}", release.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically point `current` at `release`
    ///
    /// A temporary symlink is created next to `current` and renamed over it,
    /// so readers observe either the old or the new target, never neither.
    pub async fn swap_current(&self, release: &Path) -> Result<(), DeployError> {
        let tmp = self
            .base
            .join(format!(".{}-{}.tmp", CURRENT_LINK, Uuid::new_v4().simple()));

        tokio::fs::symlink(release, &tmp).await?;
        if let Err(e) = tokio::fs::rename(&tmp, self.current_link()).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        info!(
            "{} -> {}",
            self.current_link().display(),
            release.display()
        );
        Ok(())
    }

    /// Release `current` points to, if any
    pub async fn current_release(&self) -> Result<Option<PathBuf>, DeployError> {
        match tokio::fs::read_link(self.current_link()).await {
            Ok(target) => Ok(Some(target)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// All release directories, oldest first
    pub async fn releases(&self) -> Result<Vec<PathBuf>, DeployError> {
        let mut entries = match tokio::fs::read_dir(self.releases_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut releases = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                releases.push(entry.path());
            }
        }
        releases.sort();
        Ok(releases)
    }

    /// Keep at most `keep` releases, deleting the oldest first.
    ///
    /// The release `current` points to is never deleted. Returns how many
    /// releases were removed.
    pub async fn prune(&self, keep: usize) -> Result<usize, DeployError> {
        let current = self.current_release().await?;
        let releases = self.releases().await?;
        let keep = keep.max(1);

        let excess = releases.len().saturating_sub(keep);
        let mut removed = 0;
        for release in releases.iter() {
            if removed == excess {
                break;
            }
            if current.as_deref() == Some(release.as_path()) {
                continue;
            }
            match self.remove_release(release).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to prune {}: {}", release.display(), e),
            }
        }

        if removed > 0 {
            info!("Pruned {} old releases of {}", removed, self.base.display());
        }
        Ok(removed)
    }
}
