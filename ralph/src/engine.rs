//! The propose → validate → commit loop.
//!
//! For each pending task the engine runs up to `retries` attempts of
//! *build context → invoke agent → validate*. The first passing validation
//! finalizes the task as DONE and commits it; an exhausted budget finalizes it
//! as FAILED. Configuration problems (no usable provider, missing
//! `validation_cmd`, malformed frontmatter, an unwritable context file) fail
//! the task immediately without consuming further attempts.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::commit_message::derive_commit_message;
use crate::core::task::Task;
use crate::core::types::{AttemptRecord, TaskStatus};
use crate::error::TaskError;
use crate::io::agent::{Agent, AgentRequest};
use crate::io::config::RalphConfig;
use crate::io::context::ContextBuilder;
use crate::io::git::Committer;
use crate::io::task_store::TaskStore;
use crate::io::validation::Validator;
use crate::observer::{LoopEvent, Observer};

/// Per-run knobs, resolved once from config.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Attempts per task (>= 1).
    pub retries: u32,
    /// `Duration::ZERO` disables the timeout.
    pub agent_timeout: Duration,
    /// `Duration::ZERO` disables the timeout.
    pub validation_timeout: Duration,
    /// Provider used when a task does not name one.
    pub default_provider: Option<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            retries: 3,
            agent_timeout: Duration::ZERO,
            validation_timeout: Duration::ZERO,
            default_provider: None,
        }
    }
}

impl EngineSettings {
    pub fn from_config(cfg: &RalphConfig) -> Self {
        Self {
            retries: cfg.retries.max(1),
            agent_timeout: cfg.timeouts.agent(),
            validation_timeout: cfg.timeouts.validation(),
            default_provider: cfg.provider.clone(),
        }
    }
}

/// Result of running one task to a terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    pub file_name: String,
    pub status: TaskStatus,
    /// Attempts executed (0 when the task failed before its first attempt).
    pub attempts: u32,
    pub error: Option<String>,
    /// Whether a commit was created for a DONE task.
    pub committed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub tasks: Vec<TaskOutcome>,
}

impl RunSummary {
    pub fn done(&self) -> usize {
        self.count(TaskStatus::Done)
    }

    pub fn failed(&self) -> usize {
        self.count(TaskStatus::Failed)
    }

    pub fn has_failures(&self) -> bool {
        self.failed() > 0
    }

    fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }
}

pub struct LoopEngine<A, V, C> {
    store: TaskStore,
    context: ContextBuilder,
    agent: A,
    validator: V,
    committer: C,
    settings: EngineSettings,
}

impl<A: Agent, V: Validator, C: Committer> LoopEngine<A, V, C> {
    pub fn new(
        store: TaskStore,
        context: ContextBuilder,
        agent: A,
        validator: V,
        committer: C,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            context,
            agent,
            validator,
            committer,
            settings,
        }
    }

    pub fn agent(&self) -> &A {
        &self.agent
    }

    pub fn validator(&self) -> &V {
        &self.validator
    }

    pub fn committer(&self) -> &C {
        &self.committer
    }

    /// Run every pending task in file-name order, or only `target`.
    ///
    /// An unresolvable target is returned as a [`TaskError`] before any
    /// pending file is touched.
    #[instrument(skip_all, fields(target = target.unwrap_or("*")))]
    pub fn run_all(&self, target: Option<&str>, observer: &mut dyn Observer) -> Result<RunSummary> {
        let files = match target {
            Some(name) => vec![self.store.resolve(name)?],
            None => self.store.list_pending()?,
        };
        if files.is_empty() {
            observer.on_event(&LoopEvent::NoPendingTasks);
            return Ok(RunSummary::default());
        }
        info!(count = files.len(), "processing tasks");

        let mut summary = RunSummary::default();
        for file_name in files {
            let outcome = self.run_task(&file_name, observer)?;
            summary.tasks.push(outcome);
        }
        Ok(summary)
    }

    /// Drive one pending task to DONE or FAILED.
    ///
    /// Errors returned here are run-level (task store or git failures);
    /// everything task-specific ends up in the task's audit log.
    #[instrument(skip_all, fields(task = file_name))]
    pub fn run_task(&self, file_name: &str, observer: &mut dyn Observer) -> Result<TaskOutcome> {
        observer.on_event(&LoopEvent::TaskStarted {
            file_name: file_name.to_string(),
        });

        let task = match self.store.load(file_name) {
            Ok(task) => task,
            Err(err) if err.downcast_ref::<TaskError>().is_some() => {
                let error = err.to_string();
                warn!(error = %error, "task file is malformed, moving to failed");
                self.store.quarantine(file_name, &error)?;
                observer.on_event(&LoopEvent::TaskFailed {
                    file_name: file_name.to_string(),
                    attempts: 0,
                    error: error.clone(),
                });
                return Ok(TaskOutcome {
                    file_name: file_name.to_string(),
                    status: TaskStatus::Failed,
                    attempts: 0,
                    error: Some(error),
                    committed: false,
                });
            }
            Err(err) => return Err(err),
        };

        let validation_cmd = match task.validation_cmd() {
            Ok(cmd) => cmd.to_string(),
            Err(err) => return self.fail(&task, Vec::new(), err.to_string(), observer),
        };
        let provider = task
            .frontmatter
            .provider
            .as_deref()
            .or(self.settings.default_provider.as_deref())
            .map(str::trim)
            .filter(|p| !p.is_empty());
        let Some(provider) = provider else {
            let error = "no provider configured: set `provider` in ralph.toml or the task frontmatter";
            return self.fail(&task, Vec::new(), error.to_string(), observer);
        };
        let request = AgentRequest {
            provider: provider.to_string(),
            model: task.frontmatter.model.clone(),
            files: task.affected_files().to_vec(),
            timeout: self.settings.agent_timeout,
        };

        let max_attempts = self.settings.retries.max(1);
        let mut history: Vec<AttemptRecord> = Vec::new();
        for attempt in 1..=max_attempts {
            observer.on_event(&LoopEvent::AttemptStarted {
                file_name: task.file_name.clone(),
                attempt,
                max_attempts,
            });

            let prompt = match self.context.build(&task, &history) {
                Ok(path) => path,
                Err(err) => return self.fail(&task, history, format!("{err:#}"), observer),
            };

            let output = match self.agent.call(&prompt.to_string_lossy(), &request) {
                Ok(output) => output,
                Err(err) => {
                    let error = err.to_string();
                    history.push(AttemptRecord::failure(attempt, err.partial_output(), &error));
                    self.attempt_failed(&task, attempt, &error, observer);
                    if !err.is_retryable() {
                        return self.fail(&task, history, error, observer);
                    }
                    continue;
                }
            };
            observer.on_event(&LoopEvent::ProposalReceived {
                file_name: task.file_name.clone(),
                attempt,
            });

            match self
                .validator
                .validate(&validation_cmd, self.settings.validation_timeout)
            {
                Ok(()) => {
                    history.push(AttemptRecord::success(attempt, output));
                    observer.on_event(&LoopEvent::AttemptSucceeded {
                        file_name: task.file_name.clone(),
                        attempt,
                    });
                    return self.complete(&task, history, observer);
                }
                Err(err) => {
                    let error = err.to_string();
                    history.push(AttemptRecord::failure(attempt, output, &error));
                    self.attempt_failed(&task, attempt, &error, observer);
                }
            }
        }

        let error = history
            .last()
            .and_then(|record| record.error.clone())
            .unwrap_or_else(|| "attempt budget exhausted".to_string());
        self.fail(&task, history, error, observer)
    }

    fn attempt_failed(&self, task: &Task, attempt: u32, error: &str, observer: &mut dyn Observer) {
        debug!(attempt, error, "attempt failed");
        observer.on_event(&LoopEvent::AttemptFailed {
            file_name: task.file_name.clone(),
            attempt,
            error: error.to_string(),
        });
    }

    fn complete(
        &self,
        task: &Task,
        history: Vec<AttemptRecord>,
        observer: &mut dyn Observer,
    ) -> Result<TaskOutcome> {
        self.store
            .finalize(task, &history, TaskStatus::Done, None)
            .with_context(|| format!("finalize {}", task.file_name))?;

        let mut paths = vec![
            self.store.pending_path(&task.file_name),
            self.store.dir_for(TaskStatus::Done).join(&task.file_name),
        ];
        paths.extend(task.affected_files().iter().map(PathBuf::from));
        let message = derive_commit_message(task);
        let committed = self
            .committer
            .commit(&message, &paths)
            .with_context(|| format!("commit {}", task.file_name))?;

        let attempts = history.len() as u32;
        observer.on_event(&LoopEvent::TaskCompleted {
            file_name: task.file_name.clone(),
            attempts,
            committed,
        });
        Ok(TaskOutcome {
            file_name: task.file_name.clone(),
            status: TaskStatus::Done,
            attempts,
            error: None,
            committed,
        })
    }

    fn fail(
        &self,
        task: &Task,
        history: Vec<AttemptRecord>,
        error: String,
        observer: &mut dyn Observer,
    ) -> Result<TaskOutcome> {
        self.store
            .finalize(task, &history, TaskStatus::Failed, Some(&error))
            .with_context(|| format!("finalize {}", task.file_name))?;

        let attempts = history.len() as u32;
        observer.on_event(&LoopEvent::TaskFailed {
            file_name: task.file_name.clone(),
            attempts,
            error: error.clone(),
        });
        Ok(TaskOutcome {
            file_name: task.file_name.clone(),
            status: TaskStatus::Failed,
            attempts,
            error: Some(error),
            committed: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::error::{AgentError, ValidationError};
    use crate::test_support::{RecordingCommitter, ScriptedAgent, ScriptedValidator, TestRepo};

    const TASK: &str = "---\ntask_id: T-1\nvalidation_cmd: cargo test\naffected_files: src/lib.rs\n---\n# Objective\nAdd the parser\n";

    type TestEngine = LoopEngine<ScriptedAgent, ScriptedValidator, RecordingCommitter>;

    fn engine(
        repo: &TestRepo,
        agent: ScriptedAgent,
        validator: ScriptedValidator,
        retries: u32,
    ) -> TestEngine {
        LoopEngine::new(
            repo.store(),
            repo.context_builder(),
            agent,
            validator,
            RecordingCommitter::default(),
            EngineSettings {
                retries,
                default_provider: Some("fake".to_string()),
                ..EngineSettings::default()
            },
        )
    }

    fn collect(events: &mut Vec<LoopEvent>) -> impl FnMut(&LoopEvent) + '_ {
        move |event: &LoopEvent| events.push(event.clone())
    }

    fn validation_failed() -> ValidationError {
        ValidationError::Failed {
            cmd: "cargo test".to_string(),
            code: Some(101),
        }
    }

    #[test]
    fn first_passing_attempt_finalizes_done_and_commits() {
        let repo = TestRepo::new().expect("repo");
        repo.write_task("0001-feat-parser.md", TASK).expect("task");
        let engine = engine(
            &repo,
            ScriptedAgent::new(vec![Ok("wrote parser".to_string())]),
            ScriptedValidator::new(vec![Ok(())]),
            3,
        );

        let mut events = Vec::new();
        let outcome = engine
            .run_task("0001-feat-parser.md", &mut collect(&mut events))
            .expect("run");

        assert_eq!(outcome.status, TaskStatus::Done);
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.committed);
        assert!(!repo.paths().todo.join("0001-feat-parser.md").exists());
        let done = repo.read("tasks/done/0001-feat-parser.md").expect("done");
        assert!(done.starts_with(TASK));
        assert_eq!(done.matches("### Attempt").count(), 1);

        let commits = engine.committer().commits();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].0, "feat(T-1): Add the parser");
        assert!(commits[0].1.contains(&PathBuf::from("src/lib.rs")));
        assert_eq!(engine.validator().commands(), vec!["cargo test"]);

        let kinds: Vec<&str> = events.iter().map(event_kind).collect();
        assert_eq!(
            kinds,
            vec![
                "TaskStarted",
                "AttemptStarted",
                "ProposalReceived",
                "AttemptSucceeded",
                "TaskCompleted"
            ]
        );
    }

    #[test]
    fn retries_carry_history_into_next_context() {
        let repo = TestRepo::new().expect("repo");
        repo.write_task("0001-fix-bug.md", TASK).expect("task");
        let engine = engine(
            &repo,
            ScriptedAgent::new(vec![Ok("try one".to_string()), Ok("try two".to_string())]),
            ScriptedValidator::new(vec![Err(validation_failed()), Ok(())]),
            3,
        );

        let outcome = engine
            .run_task("0001-fix-bug.md", &mut |_: &LoopEvent| {})
            .expect("run");
        assert_eq!(outcome.status, TaskStatus::Done);
        assert_eq!(outcome.attempts, 2);

        let prompts = engine.agent().prompts();
        assert_eq!(prompts.len(), 2);
        assert!(!prompts[0].contains("# HISTORY"));
        assert!(prompts[1].contains("# HISTORY"));
        assert!(prompts[1].contains("### Attempt 1 Failed"));
        assert!(prompts[1].contains("exit code 101"));

        let done = repo.read("tasks/done/0001-fix-bug.md").expect("done");
        assert!(done.contains("### Attempt 1 Failed"));
        assert!(done.contains("### Attempt 2\ntry two"));
        engine.agent().assert_drained();
    }

    #[test]
    fn exhausted_budget_finalizes_failed_with_every_attempt() {
        let repo = TestRepo::new().expect("repo");
        repo.write_task("0001-a.md", TASK).expect("task");
        let engine = engine(
            &repo,
            ScriptedAgent::new(vec![
                Ok("1".to_string()),
                Err(AgentError::Exit {
                    provider: "fake".to_string(),
                    code: Some(2),
                    output: "crashed".to_string(),
                }),
                Ok("3".to_string()),
            ]),
            ScriptedValidator::new(vec![Err(validation_failed()), Err(validation_failed())]),
            3,
        );

        let mut events = Vec::new();
        let outcome = engine
            .run_task("0001-a.md", &mut collect(&mut events))
            .expect("run");

        assert_eq!(outcome.status, TaskStatus::Failed);
        assert_eq!(outcome.attempts, 3);
        assert!(engine.committer().commits().is_empty());
        let failed = repo.read("tasks/failed/0001-a.md").expect("failed");
        assert!(failed.starts_with(TASK));
        assert_eq!(failed.matches("Failed\n").count(), 3);
        assert!(failed.contains("fake failed with exit code 2"));
        assert!(failed.contains("crashed"));
        assert_eq!(
            events.iter().filter(|e| matches!(e, LoopEvent::AttemptFailed { .. })).count(),
            3
        );
        assert!(matches!(events.last(), Some(LoopEvent::TaskFailed { attempts: 3, .. })));
    }

    #[test]
    fn unknown_provider_fails_without_retrying() {
        let repo = TestRepo::new().expect("repo");
        repo.write_task("0001-a.md", TASK).expect("task");
        let engine = engine(
            &repo,
            ScriptedAgent::new(vec![Err(AgentError::UnknownProvider("fake".to_string()))]),
            ScriptedValidator::new(Vec::new()),
            3,
        );

        let outcome = engine
            .run_task("0001-a.md", &mut |_: &LoopEvent| {})
            .expect("run");
        assert_eq!(outcome.status, TaskStatus::Failed);
        assert_eq!(outcome.attempts, 1);
        assert!(engine.validator().commands().is_empty());
        engine.agent().assert_drained();
    }

    #[test]
    fn missing_validation_cmd_fails_before_any_attempt() {
        let repo = TestRepo::new().expect("repo");
        repo.write_task("0001-a.md", "# no frontmatter\n").expect("task");
        let engine = engine(
            &repo,
            ScriptedAgent::new(Vec::new()),
            ScriptedValidator::new(Vec::new()),
            3,
        );

        let outcome = engine
            .run_task("0001-a.md", &mut |_: &LoopEvent| {})
            .expect("run");
        assert_eq!(outcome.status, TaskStatus::Failed);
        assert_eq!(outcome.attempts, 0);
        assert!(outcome.error.as_deref().unwrap_or_default().contains("validation_cmd"));
        assert!(engine.agent().prompts().is_empty());
        assert!(repo.paths().failed.join("0001-a.md").exists());
    }

    #[test]
    fn malformed_task_is_quarantined_and_run_continues() {
        let repo = TestRepo::new().expect("repo");
        repo.write_task("0001-bad.md", "---\ntask_id: [\n").expect("task");
        repo.write_task("0002-good.md", TASK).expect("task");
        let engine = engine(
            &repo,
            ScriptedAgent::new(vec![Ok("ok".to_string())]),
            ScriptedValidator::new(vec![Ok(())]),
            3,
        );

        let summary = engine
            .run_all(None, &mut |_: &LoopEvent| {})
            .expect("run");
        assert_eq!(summary.failed(), 1);
        assert_eq!(summary.done(), 1);
        let bad = repo.read("tasks/failed/0001-bad.md").expect("failed");
        assert!(bad.starts_with("---\ntask_id: [\n"));
        assert!(repo.paths().done.join("0002-good.md").exists());
    }

    #[test]
    fn non_utf8_task_is_quarantined_and_run_continues() {
        let repo = TestRepo::new().expect("repo");
        fs::write(repo.paths().todo.join("0001-bad.md"), b"\xff\xfe---\n").expect("task");
        repo.write_task("0002-good.md", TASK).expect("task");
        let engine = engine(
            &repo,
            ScriptedAgent::new(vec![Ok("ok".to_string())]),
            ScriptedValidator::new(vec![Ok(())]),
            3,
        );

        let summary = engine
            .run_all(None, &mut |_: &LoopEvent| {})
            .expect("run");
        assert_eq!(summary.failed(), 1);
        assert_eq!(summary.done(), 1);
        assert!(!repo.paths().todo.join("0001-bad.md").exists());
        let bad = repo.read("tasks/failed/0001-bad.md").expect("failed");
        assert!(bad.contains("not valid UTF-8"));
        assert!(repo.paths().done.join("0002-good.md").exists());
    }

    #[test]
    fn task_provider_overrides_default() {
        let repo = TestRepo::new().expect("repo");
        let task = "---\nvalidation_cmd: true\nprovider: aider\nmodel: sonnet\n---\nbody\n";
        repo.write_task("0001-a.md", task).expect("task");
        let engine = engine(
            &repo,
            ScriptedAgent::new(vec![Ok(String::new())]),
            ScriptedValidator::new(vec![Ok(())]),
            1,
        );
        engine
            .run_task("0001-a.md", &mut |_: &LoopEvent| {})
            .expect("run");

        let requests = engine.agent().requests();
        assert_eq!(requests[0].provider, "aider");
        assert_eq!(requests[0].model.as_deref(), Some("sonnet"));
    }

    #[test]
    fn empty_queue_reports_no_pending_tasks() {
        let repo = TestRepo::new().expect("repo");
        let engine = engine(
            &repo,
            ScriptedAgent::new(Vec::new()),
            ScriptedValidator::new(Vec::new()),
            3,
        );
        let mut events = Vec::new();
        let summary = engine
            .run_all(None, &mut collect(&mut events))
            .expect("run");
        assert!(summary.tasks.is_empty());
        assert_eq!(events, vec![LoopEvent::NoPendingTasks]);
    }

    #[test]
    fn unknown_target_touches_nothing() {
        let repo = TestRepo::new().expect("repo");
        repo.write_task("0001-a.md", TASK).expect("task");
        let engine = engine(
            &repo,
            ScriptedAgent::new(Vec::new()),
            ScriptedValidator::new(Vec::new()),
            3,
        );
        let err = engine
            .run_all(Some("0009"), &mut |_: &LoopEvent| {})
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TaskError>(),
            Some(TaskError::NotFound { .. })
        ));
        assert_eq!(
            fs::read_to_string(repo.paths().todo.join("0001-a.md")).expect("read"),
            TASK
        );
    }

    fn event_kind(event: &LoopEvent) -> &'static str {
        match event {
            LoopEvent::NoPendingTasks => "NoPendingTasks",
            LoopEvent::TaskStarted { .. } => "TaskStarted",
            LoopEvent::AttemptStarted { .. } => "AttemptStarted",
            LoopEvent::ProposalReceived { .. } => "ProposalReceived",
            LoopEvent::AttemptSucceeded { .. } => "AttemptSucceeded",
            LoopEvent::AttemptFailed { .. } => "AttemptFailed",
            LoopEvent::TaskCompleted { .. } => "TaskCompleted",
            LoopEvent::TaskFailed { .. } => "TaskFailed",
        }
    }
}
