//! Target command launch and exit status translation.
//!
//! The launched command inherits stdin, stdout and stderr unmodified. Its
//! exit status becomes the pipeline's own: a normal exit propagates its code,
//! a signal death is reported as `128 + signal` (shell convention). Only a
//! failure to start the command at all is an error.

use crate::error::{Error, Result};
use std::io;
use std::process::{Command, ExitStatus, Stdio};
use tracing::{debug, info};

/// Program and arguments to run inside the assembled root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub command: String,
    pub args: Vec<String>,
}

impl LaunchSpec {
    pub fn new<I, S>(command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Builds a [`Command`] with inherited standard streams.
    pub fn to_command(&self) -> Command {
        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        command
    }
}

/// Converts a child's exit status into a process exit code.
pub fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            // Killed by signal - return 128 + signal number (shell convention)
            return 128 + signal;
        }
    }

    crate::constants::PIPELINE_FAILURE_EXIT_CODE
}

/// Spawns `command`, waits for it, and returns its exit code.
///
/// `spec` is only used for error reporting.
pub fn run_to_completion(spec: &LaunchSpec, mut command: Command) -> Result<i32> {
    info!("Launching {} {:?}", spec.command, spec.args);

    let mut child = command.spawn().map_err(|e| exec_error(spec, &e))?;
    debug!("Started {} as PID {}", spec.command, child.id());

    let status = child.wait().map_err(|e| Error::Exec {
        command: spec.command.clone(),
        reason: format!("wait failed: {}", e),
    })?;

    let code = exit_code_of(status);
    info!("{} exited with code {}", spec.command, code);
    Ok(code)
}

fn exec_error(spec: &LaunchSpec, e: &io::Error) -> Error {
    let reason = match e.kind() {
        io::ErrorKind::NotFound => "command not found".to_string(),
        io::ErrorKind::PermissionDenied => "permission denied".to_string(),
        _ => e.to_string(),
    };
    Error::Exec {
        command: spec.command.clone(),
        reason,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_echo_output() {
        let spec = LaunchSpec::new("echo", ["hello"]);
        let output = spec.to_command().stdout(Stdio::piped()).output().unwrap();

        assert_eq!(exit_code_of(output.status), 0);
        assert_eq!(output.stdout, b"hello\n");
    }

    #[test]
    fn test_nonzero_exit_propagates() {
        let spec = LaunchSpec::new("sh", ["-c", "exit 3"]);
        let code = run_to_completion(&spec, spec.to_command()).unwrap();
        assert_eq!(code, 3);
    }

    #[test]
    fn test_signal_exit_code() {
        let spec = LaunchSpec::new("sh", ["-c", "kill -TERM $$"]);
        let code = run_to_completion(&spec, spec.to_command()).unwrap();
        assert_eq!(code, 128 + libc::SIGTERM);
    }

    #[test]
    fn test_missing_binary_is_exec_error() {
        let spec = LaunchSpec::new("/nonexistent/imgrun-test-binary", Vec::<String>::new());
        let err = run_to_completion(&spec, spec.to_command()).unwrap_err();

        assert!(matches!(err, Error::Exec { .. }));
        assert!(err.to_string().contains("command not found"));
    }
}
