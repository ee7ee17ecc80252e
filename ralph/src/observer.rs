//! Lifecycle events emitted by the loop engine.
//!
//! Observers are informational only: they cannot influence control flow.

use tracing::{info, warn};

/// One step in a task's lifecycle, in emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopEvent {
    /// The queue (or the selected target) had nothing to run.
    NoPendingTasks,
    TaskStarted {
        file_name: String,
    },
    AttemptStarted {
        file_name: String,
        attempt: u32,
        max_attempts: u32,
    },
    /// The agent exited successfully; validation comes next.
    ProposalReceived {
        file_name: String,
        attempt: u32,
    },
    AttemptSucceeded {
        file_name: String,
        attempt: u32,
    },
    AttemptFailed {
        file_name: String,
        attempt: u32,
        error: String,
    },
    TaskCompleted {
        file_name: String,
        attempts: u32,
        committed: bool,
    },
    TaskFailed {
        file_name: String,
        attempts: u32,
        error: String,
    },
}

pub trait Observer {
    fn on_event(&mut self, event: &LoopEvent);
}

impl<F> Observer for F
where
    F: FnMut(&LoopEvent),
{
    fn on_event(&mut self, event: &LoopEvent) {
        self(event);
    }
}

/// Renders events as log lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn on_event(&mut self, event: &LoopEvent) {
        match event {
            LoopEvent::NoPendingTasks => info!("no pending tasks"),
            LoopEvent::TaskStarted { file_name } => info!(task = %file_name, "task started"),
            LoopEvent::AttemptStarted {
                file_name,
                attempt,
                max_attempts,
            } => info!(task = %file_name, attempt, max_attempts, "attempt started"),
            LoopEvent::ProposalReceived { file_name, attempt } => {
                info!(task = %file_name, attempt, "agent finished, validating");
            }
            LoopEvent::AttemptSucceeded { file_name, attempt } => {
                info!(task = %file_name, attempt, "validation passed");
            }
            LoopEvent::AttemptFailed {
                file_name,
                attempt,
                error,
            } => warn!(task = %file_name, attempt, error = %error, "attempt failed"),
            LoopEvent::TaskCompleted {
                file_name,
                attempts,
                committed,
            } => info!(task = %file_name, attempts, committed, "task done"),
            LoopEvent::TaskFailed {
                file_name,
                attempts,
                error,
            } => warn!(task = %file_name, attempts, error = %error, "task failed"),
        }
    }
}
