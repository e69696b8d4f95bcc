//! Per-invocation workspace.
//!
//! Each invocation gets its own directory under the configured root holding
//! the content store and the artifacts database. The directory is removed
//! exactly once, by whichever of the main flow and the deadline watcher gets
//! there first.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use soci_builder_core::config::BuilderConfig;
use soci_builder_core::context::InvocationContext;
use soci_builder_core::error::{BuilderError, Result};

/// Directory name of the content store inside a workspace.
pub const STORE_DIR: &str = "store";

/// File name of the artifacts database inside a workspace.
pub const ARTIFACTS_DB: &str = "artifacts.db";

pub struct WorkspaceManager {
    root: PathBuf,
    prefix: String,
    min_free_space_warning_bytes: u64,
}

impl WorkspaceManager {
    pub fn new(config: &BuilderConfig) -> Self {
        Self {
            root: config.workspace_root.clone(),
            prefix: config.workspace_prefix.clone(),
            min_free_space_warning_bytes: config.min_free_space_warning_bytes,
        }
    }

    /// Allocate a fresh workspace for the invocation in `ctx`.
    ///
    /// Low free space is only logged; the build may still fit.
    pub fn create(&self, ctx: &InvocationContext) -> Result<Workspace> {
        match fs2::available_space(&self.root) {
            Ok(free) => {
                tracing::info!(
                    path = %self.root.display(),
                    free_bytes = free,
                    "Available space on workspace mount"
                );
                if free < self.min_free_space_warning_bytes {
                    tracing::warn!(
                        path = %self.root.display(),
                        free_bytes = free,
                        threshold_bytes = self.min_free_space_warning_bytes,
                        "Free space is below the threshold, large images may not fit"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(path = %self.root.display(), error = %e, "Failed to read available space");
            }
        }

        let prefix = format!("{}-{}-", self.prefix, ctx.request_id());
        let root_dir = tempfile::Builder::new()
            .prefix(&prefix)
            .tempdir_in(&self.root)
            .map_err(|e| {
                BuilderError::DirectoryError(format!(
                    "Failed to create workspace under {}: {}",
                    self.root.display(),
                    e
                ))
            })?
            .keep();

        tracing::debug!(workspace = %root_dir.display(), "Created workspace");
        Ok(Workspace::new(root_dir))
    }
}

/// An allocated workspace. Clones share the one-shot removal guard.
#[derive(Debug, Clone)]
pub struct Workspace {
    root_dir: PathBuf,
    blob_store_path: PathBuf,
    metadata_db_path: PathBuf,
    destroyed: Arc<AtomicBool>,
}

impl Workspace {
    fn new(root_dir: PathBuf) -> Self {
        Self {
            blob_store_path: root_dir.join(STORE_DIR),
            metadata_db_path: root_dir.join(ARTIFACTS_DB),
            root_dir,
            destroyed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn blob_store_path(&self) -> &Path {
        &self.blob_store_path
    }

    pub fn metadata_db_path(&self) -> &Path {
        &self.metadata_db_path
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Remove the workspace tree.
    ///
    /// Only the first call across all clones removes anything; it returns
    /// `true`. A tree that is already gone is not an error.
    pub async fn destroy(&self, ctx: &InvocationContext) -> bool {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return false;
        }

        match tokio::fs::remove_dir_all(&self.root_dir).await {
            Ok(()) => {
                tracing::debug!(
                    request_id = %ctx.request_id(),
                    workspace = %self.root_dir.display(),
                    "Removed workspace"
                );
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(
                    request_id = %ctx.request_id(),
                    workspace = %self.root_dir.display(),
                    error = %e,
                    "Failed to remove workspace"
                );
            }
        }
        true
    }

    /// Remove anything written under an already destroyed workspace.
    ///
    /// Writes that were in flight when the tree was removed can leave a
    /// partial tree behind. Call once no writer is left; returns `true` if
    /// residue was found.
    pub async fn sweep(&self, ctx: &InvocationContext) -> bool {
        if !self.is_destroyed() || !self.root_dir.exists() {
            return false;
        }

        tracing::warn!(
            request_id = %ctx.request_id(),
            workspace = %self.root_dir.display(),
            "Removing workspace residue left after reclamation"
        );
        match tokio::fs::remove_dir_all(&self.root_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(
                    request_id = %ctx.request_id(),
                    workspace = %self.root_dir.display(),
                    error = %e,
                    "Failed to remove workspace residue"
                );
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(root: &Path) -> WorkspaceManager {
        WorkspaceManager::new(&BuilderConfig {
            workspace_root: root.to_path_buf(),
            ..Default::default()
        })
    }

    #[test]
    fn test_create_layout() {
        let tmp = TempDir::new().unwrap();
        let ctx = InvocationContext::with_request_id("req1");
        let ws = manager(tmp.path()).create(&ctx).unwrap();

        assert!(ws.root_dir().is_dir());
        assert!(ws.root_dir().starts_with(tmp.path()));
        let name = ws.root_dir().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("soci-index-req1-"));
        assert_eq!(ws.blob_store_path(), ws.root_dir().join("store"));
        assert_eq!(ws.metadata_db_path(), ws.root_dir().join("artifacts.db"));
    }

    #[test]
    fn test_create_unique() {
        let tmp = TempDir::new().unwrap();
        let ctx = InvocationContext::with_request_id("req1");
        let mgr = manager(tmp.path());
        let a = mgr.create(&ctx).unwrap();
        let b = mgr.create(&ctx).unwrap();
        assert_ne!(a.root_dir(), b.root_dir());
    }

    #[test]
    fn test_create_fails_without_root() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("missing");
        let err = manager(&missing)
            .create(&InvocationContext::new())
            .unwrap_err();
        assert!(matches!(err, BuilderError::DirectoryError(_)));
    }

    #[tokio::test]
    async fn test_destroy_once() {
        let tmp = TempDir::new().unwrap();
        let ctx = InvocationContext::new();
        let ws = manager(tmp.path()).create(&ctx).unwrap();
        std::fs::create_dir_all(ws.blob_store_path().join("blobs")).unwrap();
        std::fs::write(ws.metadata_db_path(), b"{}").unwrap();

        let other = ws.clone();
        assert!(ws.destroy(&ctx).await);
        assert!(!ws.root_dir().exists());
        assert!(other.is_destroyed());
        assert!(!other.destroy(&ctx).await);
        assert!(!ws.destroy(&ctx).await);
    }

    #[tokio::test]
    async fn test_destroy_tolerates_missing_dir() {
        let tmp = TempDir::new().unwrap();
        let ctx = InvocationContext::new();
        let ws = manager(tmp.path()).create(&ctx).unwrap();
        std::fs::remove_dir_all(ws.root_dir()).unwrap();

        assert!(ws.destroy(&ctx).await);
        assert!(ws.is_destroyed());
    }

    #[tokio::test]
    async fn test_sweep_removes_residue_after_destroy() {
        let tmp = TempDir::new().unwrap();
        let ctx = InvocationContext::new();
        let ws = manager(tmp.path()).create(&ctx).unwrap();

        // Live workspaces are never swept
        assert!(!ws.sweep(&ctx).await);
        assert!(ws.root_dir().exists());

        assert!(ws.destroy(&ctx).await);
        std::fs::create_dir_all(ws.blob_store_path().join("blobs")).unwrap();
        assert!(ws.sweep(&ctx).await);
        assert!(!ws.root_dir().exists());
        assert!(!ws.sweep(&ctx).await);
    }
}
