//! Shared types for attempt bookkeeping and task lifecycle.

use std::fmt;

/// Outcome of a single propose → validate attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    Failure,
}

/// One entry of a task's audit trail.
///
/// Records are appended in attempt order and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    /// 1-indexed attempt number.
    pub number: u32,
    pub outcome: AttemptOutcome,
    /// Combined agent stdout/stderr (empty when the agent never produced output).
    pub agent_output: String,
    /// Agent or validation error for failed attempts.
    pub error: Option<String>,
}

impl AttemptRecord {
    pub fn success(number: u32, agent_output: impl Into<String>) -> Self {
        Self {
            number,
            outcome: AttemptOutcome::Success,
            agent_output: agent_output.into(),
            error: None,
        }
    }

    pub fn failure(number: u32, agent_output: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            number,
            outcome: AttemptOutcome::Failure,
            agent_output: agent_output.into(),
            error: Some(error.into()),
        }
    }

    /// Render the record as a Markdown block for history and audit logs.
    pub fn render(&self) -> String {
        let mut buf = match self.outcome {
            AttemptOutcome::Success => format!("### Attempt {}\n", self.number),
            AttemptOutcome::Failure => format!("### Attempt {} Failed\n", self.number),
        };
        if let Some(error) = &self.error {
            buf.push_str(&format!("Error: {}\n", error.trim()));
        }
        let output = self.agent_output.trim();
        if !output.is_empty() {
            if self.error.is_some() {
                buf.push_str("\nAgent output:\n");
            }
            buf.push_str(output);
            buf.push('\n');
        }
        buf
    }
}

/// Join attempt records into the history text shared by context and audit log.
pub fn render_history(history: &[AttemptRecord]) -> String {
    history
        .iter()
        .map(AttemptRecord::render)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Terminal lifecycle directory for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Done,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Done => "DONE",
            TaskStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolve the model to pass to a provider.
///
/// Precedence: task override, then the provider's own default, then the run
/// default. `None` means the provider is invoked without a model flag.
pub fn resolve_model(
    task: Option<&str>,
    provider_default: Option<&str>,
    run_default: Option<&str>,
) -> Option<String> {
    [task, provider_default, run_default]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|m| !m.is_empty())
        .map(str::to_string)
}
