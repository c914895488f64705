//! Linux isolation via `chroot(2)` and `unshare(CLONE_NEWPID)`.
//!
//! ## Privilege Requirements
//!
//! - `CAP_SYS_CHROOT` for the root change
//! - `CAP_SYS_ADMIN` for the PID namespace
//!
//! In practice the binary runs as root.
//!
//! ## Leaving the Root
//!
//! Before changing root the isolator opens the original `/` (close-on-exec,
//! so the launched command never inherits it) and remembers the working
//! directory. The returned [`RootGuard`] uses them to return the parent to
//! its original root once the command has exited, so the run's workspace
//! can still be removed by path.
//!
//! ## PID Namespace
//!
//! `unshare(CLONE_NEWPID)` only changes the namespace of the calling
//! thread's future children, and a namespace is unusable once its PID 1
//! has exited. Every launch therefore runs on a fresh thread that unshares
//! before spawning the command and exits with it.

use super::{IsolationProvider, RootGuard};
use crate::error::{Error, Result};
use crate::launch::{LaunchSpec, run_to_completion};
use std::env;
use std::fs::{self, File};
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use tracing::{debug, info};

/// `PATH` given to the command when the parent has none.
const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Native Linux isolation provider.
#[derive(Debug)]
pub struct NamespaceIsolator {
    pid_namespace: bool,
    /// Root entered last, for error reporting.
    current_root: Mutex<Option<PathBuf>>,
}

impl NamespaceIsolator {
    /// Creates an isolator; `pid_namespace` controls whether launched
    /// commands get their own PID namespace.
    pub fn new(pid_namespace: bool) -> Self {
        Self {
            pid_namespace,
            current_root: Mutex::new(None),
        }
    }

    /// Root entered last, or `/` before any root change.
    fn current_root(&self) -> PathBuf {
        self.current_root
            .lock()
            .ok()
            .and_then(|root| root.clone())
            .unwrap_or_else(|| PathBuf::from("/"))
    }
}

/// Moves the calling thread's future children into a new PID namespace.
fn unshare_pid_namespace() -> io::Result<()> {
    // SAFETY: unshare only affects namespaces of the calling thread's
    // future children; no memory is shared with the kernel.
    if unsafe { libc::unshare(libc::CLONE_NEWPID) } != 0 {
        return Err(io::Error::last_os_error());
    }
    debug!("Created PID namespace for launched command");
    Ok(())
}

impl Default for NamespaceIsolator {
    fn default() -> Self {
        Self::new(true)
    }
}

impl IsolationProvider for NamespaceIsolator {
    fn enter_root(&self, root: &Path) -> Result<RootGuard> {
        let fail = |reason: String| Error::Isolation {
            path: root.to_path_buf(),
            reason,
        };

        let meta = fs::metadata(root).map_err(|e| fail(format!("root not accessible: {}", e)))?;
        if !meta.is_dir() {
            return Err(fail("root is not a directory".to_string()));
        }
        let root = root
            .canonicalize()
            .map_err(|e| fail(format!("cannot resolve root: {}", e)))?;

        let old_root = File::open("/").map_err(|e| fail(format!("cannot open /: {}", e)))?;
        let old_cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));

        std::os::unix::fs::chroot(&root).map_err(|e| match e.kind() {
            io::ErrorKind::PermissionDenied => {
                fail("chroot requires CAP_SYS_CHROOT (run as root)".to_string())
            }
            _ => fail(format!("chroot failed: {}", e)),
        })?;

        let guard = RootGuard::new(root.clone(), move || leave_root(&old_root, &old_cwd));

        env::set_current_dir("/").map_err(|e| fail(format!("chdir to new root failed: {}", e)))?;

        if let Ok(mut current) = self.current_root.lock() {
            *current = Some(root.clone());
        }
        info!("Entered root {}", root.display());
        Ok(guard)
    }

    fn launch(&self, spec: &LaunchSpec) -> Result<i32> {
        let pid_namespace = self.pid_namespace;
        let root = self.current_root();
        let task = spec.clone();
        let handle = thread::Builder::new()
            .name("imgrun-launch".to_string())
            .spawn(move || {
                if pid_namespace {
                    unshare_pid_namespace().map_err(|e| Error::Isolation {
                        path: root,
                        reason: format!("unshare(CLONE_NEWPID) failed: {}", e),
                    })?;
                }
                let mut command = task.to_command();
                if env::var_os("PATH").is_none() {
                    command.env("PATH", DEFAULT_PATH);
                }
                run_to_completion(&task, command)
            })
            .map_err(|e| Error::Exec {
                command: spec.command.clone(),
                reason: format!("cannot start launch thread: {}", e),
            })?;

        handle.join().unwrap_or_else(|_| {
            Err(Error::Exec {
                command: spec.command.clone(),
                reason: "launch thread panicked".to_string(),
            })
        })
    }
}

/// Returns the process to the root held open in `old_root`.
fn leave_root(old_root: &File, old_cwd: &Path) -> io::Result<()> {
    // SAFETY: fchdir on a descriptor we own and keep open for the call.
    if unsafe { libc::fchdir(old_root.as_raw_fd()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    std::os::unix::fs::chroot(".")?;
    env::set_current_dir(old_cwd).or_else(|_| env::set_current_dir("/"))
}
