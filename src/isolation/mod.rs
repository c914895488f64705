//! # Process Isolation
//!
//! Root change and PID namespace creation are privileged, OS-specific
//! operations. They sit behind [`IsolationProvider`] so the pipeline stays
//! platform independent and can be driven by a fake in tests.
//!
//! | Provider             | Platform  | Root change | PID namespace        |
//! |----------------------|-----------|-------------|----------------------|
//! | [`NamespaceIsolator`]| Linux     | `chroot(2)` | `unshare(CLONE_NEWPID)` |
//! | [`UnsupportedIsolator`] | others | fails       | fails                |
//!
//! ## Threads
//!
//! The root change applies to the whole process, so the pipeline runs
//! [`IsolationProvider::enter_root`], [`IsolationProvider::launch`] and the
//! guard release together inside one blocking task. On Linux the PID
//! namespace applies to children of the *calling thread*; the provider
//! creates it on a dedicated thread per launch.

#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "linux")]
pub use linux::NamespaceIsolator;

use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::launch::LaunchSpec;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Confines the process to an assembled root and launches commands in it.
pub trait IsolationProvider: Send + Sync {
    /// Changes the filesystem root of the calling process to `root`.
    ///
    /// Must be the last filesystem-affecting step before
    /// [`launch`](Self::launch). The returned guard undoes the change when
    /// released or dropped, after the launched command has exited.
    fn enter_root(&self, root: &Path) -> Result<RootGuard>;

    /// Starts `spec` in a new PID namespace with inherited standard streams,
    /// waits for it, and returns its exit code.
    fn launch(&self, spec: &LaunchSpec) -> Result<i32>;
}

type RestoreFn = Box<dyn FnOnce() -> std::io::Result<()> + Send>;

/// Scoped root change returned by [`IsolationProvider::enter_root`].
pub struct RootGuard {
    root: PathBuf,
    restore: Option<RestoreFn>,
}

impl RootGuard {
    /// Creates a guard that runs `restore` when released.
    pub fn new<F>(root: impl Into<PathBuf>, restore: F) -> Self
    where
        F: FnOnce() -> std::io::Result<()> + Send + 'static,
    {
        Self {
            root: root.into(),
            restore: Some(Box::new(restore)),
        }
    }

    /// Creates a guard with nothing to undo.
    pub fn noop(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            restore: None,
        }
    }

    /// Root directory the process was confined to.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Undoes the root change now, reporting any failure.
    pub fn release(mut self) -> Result<()> {
        match self.restore.take() {
            Some(restore) => restore().map_err(|e| Error::Isolation {
                path: self.root.clone(),
                reason: format!("failed to restore original root: {}", e),
            }),
            None => Ok(()),
        }
    }
}

impl Drop for RootGuard {
    fn drop(&mut self) {
        if let Some(restore) = self.restore.take() {
            match restore() {
                Ok(()) => debug!("Left root {}", self.root.display()),
                Err(e) => warn!("Failed to leave root {}: {}", self.root.display(), e),
            }
        }
    }
}

impl fmt::Debug for RootGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootGuard")
            .field("root", &self.root)
            .field("active", &self.restore.is_some())
            .finish()
    }
}

/// Provider for platforms without chroot and PID namespaces.
#[derive(Debug, Default)]
pub struct UnsupportedIsolator;

impl IsolationProvider for UnsupportedIsolator {
    fn enter_root(&self, root: &Path) -> Result<RootGuard> {
        Err(Error::Isolation {
            path: root.to_path_buf(),
            reason: "process isolation requires Linux".to_string(),
        })
    }

    fn launch(&self, spec: &LaunchSpec) -> Result<i32> {
        Err(Error::Exec {
            command: spec.command.clone(),
            reason: "process isolation requires Linux".to_string(),
        })
    }
}

/// Returns the provider for the current operating system.
pub fn default_provider(config: &PipelineConfig) -> Box<dyn IsolationProvider> {
    #[cfg(target_os = "linux")]
    {
        Box::new(NamespaceIsolator::new(config.pid_namespace))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = config;
        Box::new(UnsupportedIsolator)
    }
}
