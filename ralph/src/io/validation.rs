//! Validation command runner.
//!
//! A task's `validation_cmd` is a shell string written by the user, so unlike
//! agent invocations it goes through the platform shell. Output is inherited
//! so the user sees test results live.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::error::ValidationError;
use crate::io::process::{ProcessError, run_inherited};

/// Abstraction over validation runners.
pub trait Validator {
    /// Run `cmd`; `Duration::ZERO` disables the timeout.
    fn validate(&self, cmd: &str, timeout: Duration) -> Result<(), ValidationError>;
}

/// Runs validation commands through `sh -c` (`cmd /C` on Windows).
#[derive(Debug, Clone, Default)]
pub struct ShellValidator {
    workdir: Option<PathBuf>,
}

impl ShellValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run commands from `workdir` instead of the current directory.
    pub fn in_dir(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: Some(workdir.into()),
        }
    }

    fn command(&self, cmd: &str) -> Command {
        let mut command = if cfg!(windows) {
            let mut c = Command::new("cmd");
            c.arg("/C").arg(cmd);
            c
        } else {
            let mut c = Command::new("sh");
            c.arg("-c").arg(cmd);
            c
        };
        if let Some(dir) = &self.workdir {
            command.current_dir(dir);
        }
        command
    }
}

impl Validator for ShellValidator {
    #[instrument(skip_all, fields(cmd = cmd, timeout_ms = timeout.as_millis() as u64))]
    fn validate(&self, cmd: &str, timeout: Duration) -> Result<(), ValidationError> {
        info!(cmd, "running validation");
        let limit = (!timeout.is_zero()).then_some(timeout);
        let exit = run_inherited(self.command(cmd), limit).map_err(|err| match err {
            ProcessError::Spawn(source) => ValidationError::Spawn {
                cmd: cmd.to_string(),
                source,
            },
            ProcessError::Io { source, .. } => ValidationError::Io {
                cmd: cmd.to_string(),
                source,
            },
        })?;

        if exit.timed_out {
            warn!("validation timed out");
            return Err(ValidationError::TimedOut {
                cmd: cmd.to_string(),
                timeout,
            });
        }
        if !exit.status.success() {
            debug!(exit_code = ?exit.status.code(), "validation failed");
            return Err(ValidationError::Failed {
                cmd: cmd.to_string(),
                code: exit.status.code(),
            });
        }
        debug!("validation passed");
        Ok(())
    }
}
