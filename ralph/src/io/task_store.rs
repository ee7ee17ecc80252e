//! Task persistence: lists, loads and finalizes task files.
//!
//! Tasks live in exactly one of the `todo`, `done` and `failed` directories.
//! Finalizing writes the audit-annotated file into the target directory
//! (temp file + rename) before removing the pending file.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use crate::core::task::Task;
use crate::core::types::{AttemptRecord, TaskStatus, render_history};
use crate::error::TaskError;

/// What `finalize` did with the task file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// Pending file was written to the target directory and removed.
    Moved(PathBuf),
    /// Pending file was already gone; the audit was appended to the target.
    Appended(PathBuf),
    /// Neither file existed; nothing was written.
    Missing,
}

#[derive(Debug, Clone)]
pub struct TaskStore {
    todo: PathBuf,
    done: PathBuf,
    failed: PathBuf,
}

impl TaskStore {
    pub fn new(todo: impl Into<PathBuf>, done: impl Into<PathBuf>, failed: impl Into<PathBuf>) -> Self {
        Self {
            todo: todo.into(),
            done: done.into(),
            failed: failed.into(),
        }
    }

    pub fn todo_dir(&self) -> &Path {
        &self.todo
    }

    pub fn dir_for(&self, status: TaskStatus) -> &Path {
        match status {
            TaskStatus::Done => &self.done,
            TaskStatus::Failed => &self.failed,
        }
    }

    pub fn pending_path(&self, file_name: &str) -> PathBuf {
        self.todo.join(file_name)
    }

    /// Pending task file names in processing (lexicographic) order.
    pub fn list_pending(&self) -> Result<Vec<String>> {
        list_markdown(&self.todo)
    }

    /// Map a user-supplied task name to a pending file name.
    ///
    /// Accepts the exact file name, the name without `.md`, or a unique
    /// file-name prefix such as `0002`.
    pub fn resolve(&self, name: &str) -> Result<String> {
        let pending = self.list_pending()?;
        let name = name.trim();
        let with_ext = format!("{name}.md");
        if let Some(found) = pending.iter().find(|f| **f == name || **f == with_ext) {
            return Ok(found.clone());
        }
        let mut matches: Vec<String> = pending
            .into_iter()
            .filter(|f| !name.is_empty() && f.starts_with(name))
            .collect();
        match matches.len() {
            0 => Err(TaskError::NotFound {
                name: name.to_string(),
                dir: self.todo.clone(),
            }
            .into()),
            1 => Ok(matches.remove(0)),
            _ => Err(TaskError::Ambiguous {
                name: name.to_string(),
                candidates: matches,
            }
            .into()),
        }
    }

    /// Read and parse a pending task.
    pub fn load(&self, file_name: &str) -> Result<Task> {
        let path = self.pending_path(file_name);
        let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
        let raw = String::from_utf8(bytes).map_err(|err| TaskError::Parse {
            file_name: file_name.to_string(),
            reason: format!("not valid UTF-8 ({err})"),
        })?;
        Ok(Task::parse(file_name, raw)?)
    }

    /// Append the audit log to the task and move it to the status directory.
    #[instrument(skip_all, fields(file = %task.file_name, status = %status))]
    pub fn finalize(
        &self,
        task: &Task,
        history: &[AttemptRecord],
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<FinalizeOutcome> {
        self.finalize_raw(&task.file_name, Some(&task.raw), history, status, error)
    }

    /// Move a task that could not be loaded into `failed`, keeping its raw content.
    #[instrument(skip_all, fields(file = file_name))]
    pub fn quarantine(&self, file_name: &str, error: &str) -> Result<FinalizeOutcome> {
        let pending = self.pending_path(file_name);
        let raw = fs::read(&pending)
            .ok()
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned());
        self.finalize_raw(file_name, raw.as_deref(), &[], TaskStatus::Failed, Some(error))
    }

    fn finalize_raw(
        &self,
        file_name: &str,
        raw: Option<&str>,
        history: &[AttemptRecord],
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<FinalizeOutcome> {
        let pending = self.pending_path(file_name);
        let target_dir = self.dir_for(status);
        let target = target_dir.join(file_name);
        let audit = render_audit(status, error, history);

        if let (true, Some(raw)) = (pending.exists(), raw) {
            fs::create_dir_all(target_dir)
                .with_context(|| format!("create {}", target_dir.display()))?;
            write_atomic(&target, &format!("{raw}{audit}"))?;
            fs::remove_file(&pending)
                .with_context(|| format!("remove {}", pending.display()))?;
            debug!(target = %target.display(), "task moved");
            return Ok(FinalizeOutcome::Moved(target));
        }

        if target.exists() {
            let mut file = OpenOptions::new()
                .append(true)
                .open(&target)
                .with_context(|| format!("open {}", target.display()))?;
            file.write_all(audit.as_bytes())
                .with_context(|| format!("append audit to {}", target.display()))?;
            warn!(target = %target.display(), "pending file missing, appended audit to existing target");
            return Ok(FinalizeOutcome::Appended(target));
        }

        warn!(
            pending = %pending.display(),
            target = %target.display(),
            "task file missing at both pending and target paths, audit log not written"
        );
        Ok(FinalizeOutcome::Missing)
    }
}

/// Markdown file names in `dir`, sorted. A missing directory is empty.
pub fn list_markdown(dir: &Path) -> Result<Vec<String>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read dir {}", dir.display()))? {
        let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        if let Some(name) = entry.file_name().to_str()
            && name.ends_with(".md")
        {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

/// Audit section appended to finalized task files.
pub fn render_audit(status: TaskStatus, error: Option<&str>, history: &[AttemptRecord]) -> String {
    let mut buf = String::from("\n\n## Ralph Audit Log\n");
    buf.push_str(&format!("- Status: {status}\n"));
    buf.push_str(&format!("- Attempts: {}\n", history.len()));
    if let Some(error) = error.map(str::trim).filter(|e| !e.is_empty()) {
        buf.push_str(&format!("- Error: {error}\n"));
    }
    if !history.is_empty() {
        buf.push('\n');
        buf.push_str(&render_history(history));
    }
    buf
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let tmp_path = path.with_extension("md.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
