//! Git adapter: worktree pre-flight and task commits.
//!
//! Commits are scoped to the paths a task touched so unrelated changes in the
//! worktree never ride along.

use std::path::{Component, Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    pub path: String,
}

/// Records a finished task in version control.
pub trait Committer {
    /// Stage `paths` (everything when empty) and commit with `message`.
    ///
    /// Returns false when nothing was staged and no commit was made.
    fn commit(&self, message: &str, paths: &[PathBuf]) -> Result<bool>;
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// True when `workdir` is inside a git work tree.
    pub fn is_repo(&self) -> bool {
        self.run(&["rev-parse", "--is-inside-work-tree"])
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    /// Status entries (including untracked) in porcelain format.
    ///
    /// Paths are relative to the repository top level, not `workdir`.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        out.lines()
            .filter(|line| !line.trim().is_empty())
            .map(parse_status_line)
            .collect()
    }

    /// Changes anywhere in the repository, except under the `exempt` paths.
    ///
    /// `exempt` entries are relative to `workdir` (absolute paths inside it
    /// are accepted too), which may be a subdirectory of the repository.
    pub fn dirty_entries(&self, exempt: &[&Path]) -> Result<Vec<StatusEntry>> {
        let prefix = self.run_capture(&["rev-parse", "--show-prefix"])?;
        let prefix = prefix.trim();
        let exempt: Vec<String> = exempt
            .iter()
            .map(|path| {
                let rel = path.strip_prefix(&self.workdir).unwrap_or(path);
                let mut full = prefix.trim_end_matches('/').to_string();
                for part in rel.components() {
                    if let Component::Normal(part) = part {
                        if !full.is_empty() {
                            full.push('/');
                        }
                        full.push_str(&part.to_string_lossy());
                    }
                }
                full
            })
            .collect();
        Ok(self
            .status_porcelain()?
            .into_iter()
            .filter(|entry| !exempt.iter().any(|dir| is_within(&entry.path, dir)))
            .collect())
    }

    pub fn is_tracked(&self, path: &Path) -> Result<bool> {
        let path = path.to_string_lossy();
        let out = self.run(&["ls-files", "--error-unmatch", "--", &path])?;
        Ok(out.status.success())
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// Stage `paths`, including deletions of tracked files.
    ///
    /// Paths that are neither tracked nor present on disk are skipped, since
    /// git rejects pathspecs that match nothing.
    #[instrument(skip_all, fields(count = paths.len()))]
    pub fn stage_paths(&self, paths: &[PathBuf]) -> Result<usize> {
        let mut stageable = Vec::new();
        for path in paths {
            let path = path.strip_prefix(&self.workdir).unwrap_or(path);
            if self.workdir.join(path).exists() || self.is_tracked(path)? {
                stageable.push(path.to_string_lossy().into_owned());
            } else {
                debug!(path = %path.display(), "skipping path unknown to git");
            }
        }
        if stageable.is_empty() {
            return Ok(0);
        }
        let mut args = vec!["add", "-A", "--"];
        args.extend(stageable.iter().map(String::as_str));
        self.run_checked(&args)?;
        Ok(stageable.len())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        self.run_checked(&["commit", "-m", message])?;
        info!(message, "committed");
        Ok(true)
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

impl Committer for Git {
    fn commit(&self, message: &str, paths: &[PathBuf]) -> Result<bool> {
        if paths.is_empty() {
            self.add_all()?;
        } else {
            self.stage_paths(paths)?;
        }
        self.commit_staged(message)
    }
}

fn is_within(path: &str, dir: &str) -> bool {
    path.strip_prefix(dir).is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}
