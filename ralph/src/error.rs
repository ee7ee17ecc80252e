//! Typed errors for the loop engine's failure taxonomy.
//!
//! Functions still return `anyhow::Result` where the caller only needs to
//! report; these types exist where the engine must decide between retrying an
//! attempt and aborting a task.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors locating or parsing a task file.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task '{name}' not found in {}", .dir.display())]
    NotFound { name: String, dir: PathBuf },

    #[error("task '{name}' is ambiguous, matches: {}", .candidates.join(", "))]
    Ambiguous {
        name: String,
        candidates: Vec<String>,
    },

    #[error("malformed task file {file_name}: {reason}")]
    Parse { file_name: String, reason: String },

    #[error("task {file_name} is missing required frontmatter field '{field}'")]
    MissingField {
        file_name: String,
        field: &'static str,
    },
}

/// Errors from invoking an agent provider.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("provider {provider} could not build its command: {reason}")]
    Build { provider: String, reason: String },

    #[error("{provider} failed to start ({executable}): {source}")]
    Spawn {
        provider: String,
        executable: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{provider} failed with exit code {}", display_code(.code))]
    Exit {
        provider: String,
        code: Option<i32>,
        output: String,
    },

    #[error("{provider} timed out after {}ms", .timeout.as_millis())]
    Timeout {
        provider: String,
        timeout: Duration,
        output: String,
    },

    #[error("{provider} i/o error: {source}")]
    Io {
        provider: String,
        #[source]
        source: std::io::Error,
    },
}

impl AgentError {
    /// Soft errors consume an attempt; the rest abort the task.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            AgentError::UnknownProvider(_) | AgentError::Build { .. }
        )
    }

    /// Output the agent produced before failing, if any.
    pub fn partial_output(&self) -> &str {
        match self {
            AgentError::Exit { output, .. } | AgentError::Timeout { output, .. } => output,
            _ => "",
        }
    }
}

/// Errors from running a task's validation command.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("validation command `{cmd}` failed with exit code {}", display_code(.code))]
    Failed { cmd: String, code: Option<i32> },

    #[error("validation command `{cmd}` timed out after {}ms", .timeout.as_millis())]
    TimedOut { cmd: String, timeout: Duration },

    #[error("validation command `{cmd}` could not be started: {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: std::io::Error,
    },

    #[error("validation command `{cmd}` i/o error: {source}")]
    Io {
        cmd: String,
        #[source]
        source: std::io::Error,
    },
}

fn display_code(code: &Option<i32>) -> String {
    code.map_or_else(|| "none (killed by signal)".to_string(), |c| c.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_provider_is_not_retryable() {
        assert!(!AgentError::UnknownProvider("nope".to_string()).is_retryable());
        let timeout = AgentError::Timeout {
            provider: "gemini".to_string(),
            timeout: Duration::from_millis(100),
            output: String::new(),
        };
        assert!(timeout.is_retryable());
        assert_eq!(timeout.to_string(), "gemini timed out after 100ms");
    }

    #[test]
    fn exit_error_reports_code() {
        let err = AgentError::Exit {
            provider: "aider".to_string(),
            code: Some(3),
            output: "partial".to_string(),
        };
        assert_eq!(err.to_string(), "aider failed with exit code 3");
        assert_eq!(err.partial_output(), "partial");
    }
}
