//! Per-run workspace and root filesystem.
//!
//! ```text
//! $TMPDIR/imgrun-<run_id>-XXXXXX/
//! ├── layers/   downloaded archives (LayerStore)
//! └── rootfs/   assembled root (RootFilesystem)
//! ```
//!
//! The workspace is exclusively owned by one run and is removed when the
//! [`RunWorkspace`] is dropped, on success and on every failure path. The
//! archives are kept outside `rootfs/` so they never become visible to the
//! launched command.

use crate::constants::{LAYERS_DIR, ROOTFS_DIR, WORKSPACE_PREFIX};
use crate::error::Result;
use crate::storage::LayerStore;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};
use uuid::Uuid;

/// Directory that layers are extracted into and that becomes `/` for the
/// launched command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootFilesystem {
    path: PathBuf,
}

impl RootFilesystem {
    /// Wraps an existing directory.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Scratch space for one pipeline run.
pub struct RunWorkspace {
    dir: Option<TempDir>,
    layers: LayerStore,
    rootfs: RootFilesystem,
}

impl RunWorkspace {
    /// Creates a fresh workspace under `parent`, or the system temp
    /// directory when `None`.
    pub fn create(run_id: Uuid, parent: Option<&Path>) -> Result<Self> {
        let prefix = format!("{}{}-", WORKSPACE_PREFIX, run_id);
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let dir = match parent {
            Some(parent) => {
                fs::create_dir_all(parent)?;
                builder.tempdir_in(parent)?
            }
            None => builder.tempdir()?,
        };

        let layers = LayerStore::with_path(dir.path().join(LAYERS_DIR))?;

        let rootfs_path = dir.path().join(ROOTFS_DIR);
        fs::create_dir(&rootfs_path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&rootfs_path, fs::Permissions::from_mode(0o755))?;
        }

        debug!("Workspace created at {}", dir.path().display());

        Ok(Self {
            dir: Some(dir),
            layers,
            rootfs: RootFilesystem::new(rootfs_path),
        })
    }

    /// Workspace root directory.
    pub fn path(&self) -> &Path {
        match &self.dir {
            Some(dir) => dir.path(),
            None => Path::new(""),
        }
    }

    pub fn layers(&self) -> &LayerStore {
        &self.layers
    }

    pub fn rootfs(&self) -> &RootFilesystem {
        &self.rootfs
    }

    /// Removes the workspace now, reporting any failure.
    pub fn close(mut self) -> Result<()> {
        if let Some(dir) = self.dir.take() {
            let path = dir.path().to_path_buf();
            dir.close()?;
            debug!("Workspace {} removed", path.display());
        }
        Ok(())
    }
}

impl Drop for RunWorkspace {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!("Failed to remove workspace {}: {}", path.display(), e);
            } else {
                debug!("Workspace {} removed", path.display());
            }
        }
    }
}
