//! Agent invocation.
//!
//! The [`Agent`] trait decouples the loop engine from process spawning. The
//! production implementation, [`AgentInvoker`], resolves a provider from the
//! registry, builds its invocation, and runs it with a timeout. Tests use
//! scripted agents that return predetermined outputs.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::core::types::resolve_model;
use crate::error::AgentError;
use crate::io::process::{ProcessError, run_streaming};
use crate::io::providers::{BuildContext, ProviderRegistry};

pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 100_000;

/// Parameters for a single agent call.
#[derive(Debug, Clone, Default)]
pub struct AgentRequest {
    /// Provider name to look up in the registry.
    pub provider: String,
    /// Task-level model override.
    pub model: Option<String>,
    /// Affected files handed to providers that accept them.
    pub files: Vec<String>,
    /// `Duration::ZERO` disables the timeout.
    pub timeout: Duration,
}

/// Abstraction over agent backends.
pub trait Agent {
    /// Run the agent on `prompt` and return its combined output.
    fn call(&self, prompt: &str, request: &AgentRequest) -> Result<String, AgentError>;
}

/// Spawns the external agent process described by a provider.
#[derive(Debug, Clone)]
pub struct AgentInvoker {
    registry: ProviderRegistry,
    default_model: Option<String>,
    output_limit_bytes: usize,
    echo: bool,
    workdir: Option<PathBuf>,
}

impl AgentInvoker {
    pub fn new(registry: ProviderRegistry, default_model: Option<String>) -> Self {
        Self {
            registry,
            default_model,
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
            echo: true,
            workdir: None,
        }
    }

    /// Bound the output kept for the audit trail (streaming is unaffected).
    pub fn with_output_limit(mut self, bytes: usize) -> Self {
        self.output_limit_bytes = bytes;
        self
    }

    /// Forward child output to our stdout/stderr while it runs.
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Run agents from `workdir` (the project root) instead of the current directory.
    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }
}

impl Agent for AgentInvoker {
    #[instrument(skip_all, fields(provider = %request.provider, timeout_ms = request.timeout.as_millis() as u64))]
    fn call(&self, prompt: &str, request: &AgentRequest) -> Result<String, AgentError> {
        let spec = self
            .registry
            .get(&request.provider)
            .ok_or_else(|| AgentError::UnknownProvider(request.provider.clone()))?;
        if prompt.trim().is_empty() {
            return Err(AgentError::Build {
                provider: spec.name().to_string(),
                reason: "prompt is empty".to_string(),
            });
        }

        let model = resolve_model(
            request.model.as_deref(),
            spec.default_model(),
            self.default_model.as_deref(),
        );
        let invocation = spec.build(
            prompt,
            &BuildContext {
                model: model.as_deref(),
                files: &request.files,
            },
        );
        info!(
            executable = %invocation.executable,
            model = model.as_deref().unwrap_or("-"),
            args = invocation.args.len(),
            stdin = invocation.stdin.is_some(),
            "invoking agent"
        );
        debug!(args = ?invocation.args, "agent arguments");

        let mut cmd = Command::new(&invocation.executable);
        cmd.args(&invocation.args);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        let timeout = (!request.timeout.is_zero()).then_some(request.timeout);

        let output = run_streaming(
            cmd,
            invocation.stdin.map(String::into_bytes),
            timeout,
            self.output_limit_bytes,
            self.echo,
        )
        .map_err(|err| match err {
            ProcessError::Spawn(source) => AgentError::Spawn {
                provider: spec.name().to_string(),
                executable: invocation.executable.clone(),
                source,
            },
            ProcessError::Io { source, .. } => AgentError::Io {
                provider: spec.name().to_string(),
                source,
            },
        })?;

        let text = output.combined_text();
        if output.timed_out {
            warn!(timeout_ms = request.timeout.as_millis() as u64, "agent timed out");
            return Err(AgentError::Timeout {
                provider: spec.name().to_string(),
                timeout: request.timeout,
                output: text,
            });
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "agent failed");
            return Err(AgentError::Exit {
                provider: spec.name().to_string(),
                code: output.status.code(),
                output: text,
            });
        }

        debug!(bytes = output.combined.len(), "agent completed successfully");
        Ok(text)
    }
}
