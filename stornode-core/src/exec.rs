//! External command execution.
//!
//! Every LVM, device-mapper, iSCSI and image conversion call goes through a
//! [`CommandRunner`], so the engine can be driven against a fake in tests.

use crate::error::{Result, StorageError};
use crate::observability::metrics;
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, instrument};

/// Runs an external program to completion.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`, returning its stdout.
    ///
    /// A non-zero exit is reported as [`StorageError::Process`] carrying the
    /// command line, both output streams and the exit code.
    async fn run(&self, program: &str, args: &[&str]) -> Result<String>;
}

/// Runs commands on the host.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    #[instrument(skip(self, args), fields(cmd = %command_line(program, args)))]
    async fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        let output = Command::new(program).args(args).output().await.map_err(|e| {
            StorageError::Process {
                cmd: command_line(program, args),
                stdout: String::new(),
                stderr: e.to_string(),
                exit_code: -1,
            }
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() {
            metrics::record_command_failure(program);
            return Err(StorageError::Process {
                cmd: command_line(program, args),
                stdout,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                // No exit code when killed by a signal.
                exit_code: output.status.code().unwrap_or(-1),
            });
        }

        debug!(bytes = stdout.len(), "Command succeeded");
        Ok(stdout)
    }
}

/// Render a command line for logs and errors.
pub fn command_line(program: &str, args: &[&str]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}
