//! Child process execution for test adapters.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::process::Command;
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Result of running an external command.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

/// Errors raised while running a child process.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum CommandError {
    /// Raised when the process cannot be started.
    #[error("failed to start {program}: {message}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Operating system error message.
        message: String,
    },
    /// Raised when waiting on the process fails.
    #[error("failed to wait for {program}: {message}")]
    Wait {
        /// Program being waited on.
        program: String,
        /// Operating system error message.
        message: String,
    },
    /// Raised when the process was killed after cancellation.
    #[error("{program} was cancelled")]
    Cancelled {
        /// Program that was killed.
        program: String,
    },
}

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with `args`, adding `env` on top of the inherited
    /// environment. Output goes straight to the parent's terminal. The child
    /// is killed once `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] when the process cannot be started or waited
    /// on, or was cancelled.
    fn run(
        &self,
        program: &str,
        args: &[OsString],
        env: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, CommandError>;
}

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run(
        &self,
        program: &str,
        args: &[OsString],
        env: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, CommandError> {
        let wait_error = |err: std::io::Error| CommandError::Wait {
            program: program.to_owned(),
            message: err.to_string(),
        };

        let mut child = Command::new(program)
            .args(args)
            .envs(env)
            .spawn()
            .map_err(|err| CommandError::Spawn {
                program: program.to_owned(),
                message: err.to_string(),
            })?;

        loop {
            if let Some(status) = child.try_wait().map_err(wait_error)? {
                return Ok(CommandOutput {
                    code: status.code(),
                });
            }
            if cancel.is_cancelled() {
                child.kill().map_err(wait_error)?;
                child.wait().map_err(wait_error)?;
                return Err(CommandError::Cancelled {
                    program: program.to_owned(),
                });
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}
