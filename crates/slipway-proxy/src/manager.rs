//! ProxyConfigManager — owns the per-pair site files.
//!
//! Every change follows backup → atomic write → validate → reload. A
//! rejected or failed change moves the `.caddy.bak` backup back into place
//! before returning, so the proxy never keeps serving a half-applied
//! configuration. The backup is removed once the reload succeeded.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use slipway_core::Environment;

use crate::caddyfile::{SiteBlock, site_file_name};
use crate::controller::ProxyController;
use crate::error::{ProxyError, ProxyResult};

/// Record of an applied change, sufficient to undo it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedChange {
    pub path: PathBuf,
    /// Site file content before the change; `None` if it did not exist.
    pub previous: Option<String>,
    pub rendered: String,
}

pub struct ProxyConfigManager {
    sites_dir: PathBuf,
    controller: Arc<dyn ProxyController>,
    // One config change at a time across all pairs; the proxy reloads globally.
    lock: Mutex<()>,
}

impl ProxyConfigManager {
    pub fn new(sites_dir: &Path, controller: Arc<dyn ProxyController>) -> Self {
        Self {
            sites_dir: sites_dir.to_path_buf(),
            controller,
            lock: Mutex::new(()),
        }
    }

    pub fn site_path(&self, project: &str, environment: Environment) -> PathBuf {
        self.sites_dir.join(site_file_name(project, environment))
    }

    /// Current site file content for a pair, if any.
    pub async fn current(&self, project: &str, environment: Environment) -> ProxyResult<Option<String>> {
        read_optional(&self.site_path(project, environment)).await
    }

    /// Apply a site block. On any failure the previous file is restored.
    pub async fn apply(&self, block: &SiteBlock) -> ProxyResult<AppliedChange> {
        let rendered = block.render()?;
        let path = self.sites_dir.join(block.file_name());

        let _guard = self.lock.lock().await;
        tokio::fs::create_dir_all(&self.sites_dir)
            .await
            .map_err(ProxyError::io)?;

        let previous = read_optional(&path).await?;
        let backup = match &previous {
            Some(content) => {
                let backup = backup_path(&path);
                tokio::fs::write(&backup, content)
                    .await
                    .map_err(ProxyError::io)?;
                Some(backup)
            }
            None => None,
        };
        write_atomic(&path, &rendered).await?;
        debug!(path = %path.display(), "site block written");

        if let Err(e) = self.controller.validate(&path).await {
            warn!(path = %path.display(), error = %e, "proxy rejected site block, restoring backup");
            restore_backup(&path, backup.as_deref()).await?;
            return Err(e);
        }
        if let Err(e) = self.controller.reload().await {
            warn!(path = %path.display(), error = %e, "proxy reload failed, restoring backup");
            restore_backup(&path, backup.as_deref()).await?;
            if let Err(again) = self.controller.reload().await {
                warn!(error = %again, "reload after restore also failed");
            }
            return Err(match e {
                ProxyError::ReloadFailed(_) => e,
                other => ProxyError::ReloadFailed(other.to_string()),
            });
        }
        if let Some(backup) = &backup {
            if let Err(e) = tokio::fs::remove_file(backup).await {
                warn!(path = %backup.display(), error = %e, "failed to remove site backup");
            }
        }

        info!(
            project = %block.project,
            environment = %block.environment,
            slot = %block.slot,
            port = block.primary_port,
            "proxy now routes to slot"
        );
        Ok(AppliedChange {
            path,
            previous,
            rendered,
        })
    }

    /// Undo an applied change (used when the registry commit fails after
    /// the proxy already switched).
    pub async fn revert(&self, change: &AppliedChange) -> ProxyResult<()> {
        let _guard = self.lock.lock().await;
        write_back(&change.path, change.previous.as_deref()).await?;
        self.controller.reload().await?;
        warn!(path = %change.path.display(), "proxy change reverted");
        Ok(())
    }
}

/// Put the backup taken by `apply` back in place; no backup means the
/// file did not exist before.
async fn restore_backup(path: &Path, backup: Option<&Path>) -> ProxyResult<()> {
    match backup {
        Some(backup) => tokio::fs::rename(backup, path).await.map_err(ProxyError::io),
        None => remove_if_present(path).await,
    }
}

async fn write_back(path: &Path, content: Option<&str>) -> ProxyResult<()> {
    match content {
        Some(content) => write_atomic(path, content).await,
        None => remove_if_present(path).await,
    }
}

async fn remove_if_present(path: &Path) -> ProxyResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ProxyError::io(e)),
    }
}

fn backup_path(path: &Path) -> PathBuf {
    path.with_extension("caddy.bak")
}

async fn read_optional(path: &Path) -> ProxyResult<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ProxyError::io(e)),
    }
}

async fn write_atomic(path: &Path, content: &str) -> ProxyResult<()> {
    let tmp = path.with_extension("caddy.tmp");
    tokio::fs::write(&tmp, content)
        .await
        .map_err(ProxyError::io)?;
    tokio::fs::rename(&tmp, path).await.map_err(ProxyError::io)
}
