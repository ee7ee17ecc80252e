//! Test-only helpers: a throwaway git project plus scripted engine seams.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::error::{AgentError, ValidationError};
use crate::io::agent::{Agent, AgentRequest};
use crate::io::config::{DirsConfig, RunPaths};
use crate::io::context::ContextBuilder;
use crate::io::git::Committer;
use crate::io::task_store::TaskStore;
use crate::io::validation::Validator;

/// Temporary git repository laid out with the default task directories.
///
/// Starts with one commit (`.gitignore` ignoring the context directory), so
/// the worktree is clean right after construction.
pub struct TestRepo {
    dir: TempDir,
    paths: RunPaths,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp dir")?;
        let paths = RunPaths::resolve(dir.path(), &DirsConfig::default());
        for d in [&paths.todo, &paths.done, &paths.failed, &paths.personas, &paths.context] {
            fs::create_dir_all(d).with_context(|| format!("create {}", d.display()))?;
        }
        let repo = Self { dir, paths };
        repo.git(&["init", "-q"])?;
        repo.git(&["config", "user.email", "ralph@example.com"])?;
        repo.git(&["config", "user.name", "Ralph Test"])?;
        repo.git(&["config", "commit.gpgsign", "false"])?;
        fs::write(repo.path().join(".gitignore"), ".ralph/context\n")
            .context("write .gitignore")?;
        repo.git(&["add", "-A"])?;
        repo.git(&["commit", "-q", "-m", "chore: init"])?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn paths(&self) -> &RunPaths {
        &self.paths
    }

    /// Write `contents` to `<todo>/<name>`.
    pub fn write_task(&self, name: &str, contents: &str) -> Result<PathBuf> {
        let path = self.paths.todo.join(name);
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }

    pub fn write_persona(&self, name: &str, contents: &str) -> Result<PathBuf> {
        let path = self.paths.personas.join(format!("{name}.md"));
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }

    /// Read a file relative to the repository root.
    pub fn read(&self, rel: &str) -> Result<String> {
        let path = self.path().join(rel);
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    pub fn store(&self) -> TaskStore {
        TaskStore::new(&self.paths.todo, &self.paths.done, &self.paths.failed)
    }

    pub fn context_builder(&self) -> ContextBuilder {
        ContextBuilder::new(&self.paths.personas, &self.paths.context, None)
    }

    /// Stage and commit everything.
    pub fn commit_all(&self, message: &str) -> Result<()> {
        self.git(&["add", "-A"])?;
        self.git(&["commit", "-q", "-m", message])?;
        Ok(())
    }

    /// Run git in the repository and return stdout.
    pub fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(self.path())
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !output.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Agent that replays queued results and records every call.
///
/// Prompts that name a file are recorded by content, so tests can inspect the
/// context the agent would have seen.
#[derive(Debug, Default)]
pub struct ScriptedAgent {
    queue: RefCell<VecDeque<Result<String, AgentError>>>,
    prompts: RefCell<Vec<String>>,
    requests: RefCell<Vec<AgentRequest>>,
}

impl ScriptedAgent {
    pub fn new(results: Vec<Result<String, AgentError>>) -> Self {
        Self {
            queue: RefCell::new(results.into()),
            ..Self::default()
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }

    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.borrow().clone()
    }

    pub fn assert_drained(&self) {
        assert!(
            self.queue.borrow().is_empty(),
            "scripted agent has {} unused results",
            self.queue.borrow().len()
        );
    }
}

impl Agent for ScriptedAgent {
    fn call(&self, prompt: &str, request: &AgentRequest) -> Result<String, AgentError> {
        let text = fs::read_to_string(prompt).unwrap_or_else(|_| prompt.to_string());
        self.prompts.borrow_mut().push(text);
        self.requests.borrow_mut().push(request.clone());
        self.queue
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| Err(AgentError::UnknownProvider(format!(
                "scripted agent exhausted ({})",
                request.provider
            ))))
    }
}

/// Validator that replays queued results and records the commands it saw.
#[derive(Debug, Default)]
pub struct ScriptedValidator {
    queue: RefCell<VecDeque<Result<(), ValidationError>>>,
    commands: RefCell<Vec<String>>,
}

impl ScriptedValidator {
    pub fn new(results: Vec<Result<(), ValidationError>>) -> Self {
        Self {
            queue: RefCell::new(results.into()),
            commands: RefCell::new(Vec::new()),
        }
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.borrow().clone()
    }
}

impl Validator for ScriptedValidator {
    fn validate(&self, cmd: &str, _timeout: Duration) -> Result<(), ValidationError> {
        self.commands.borrow_mut().push(cmd.to_string());
        self.queue
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| Err(ValidationError::Failed {
                cmd: cmd.to_string(),
                code: None,
            }))
    }
}

/// Committer that records commit requests instead of touching git.
#[derive(Debug, Default)]
pub struct RecordingCommitter {
    commits: RefCell<Vec<(String, Vec<PathBuf>)>>,
}

impl RecordingCommitter {
    pub fn commits(&self) -> Vec<(String, Vec<PathBuf>)> {
        self.commits.borrow().clone()
    }
}

impl Committer for RecordingCommitter {
    fn commit(&self, message: &str, paths: &[PathBuf]) -> Result<bool> {
        self.commits
            .borrow_mut()
            .push((message.to_string(), paths.to_vec()));
        Ok(true)
    }
}
