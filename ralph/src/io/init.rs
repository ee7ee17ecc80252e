//! Project scaffolding for `ralph init`.
//!
//! Idempotent: existing files are left alone, so re-running `init` in a
//! configured project only fills in what is missing.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, instrument};

use crate::io::config::{CONFIG_FILE_NAME, RalphConfig, RunPaths, load_config, write_config};

const SEED_PERSONAS: [(&str, &str); 2] = [
    ("ralph.md", include_str!("templates/personas/ralph.md")),
    ("architect.md", include_str!("templates/personas/architect.md")),
];

/// Options for `init_project`.
#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    pub provider: Option<String>,
    pub model: Option<String>,
}

/// Files and directories `init_project` created (pre-existing ones excluded).
#[derive(Debug, Clone, Default)]
pub struct InitReport {
    pub config_path: PathBuf,
    pub created: Vec<PathBuf>,
}

/// Create task directories, seed personas, ignore the context directory and
/// write a default `ralph.toml` in `root`.
#[instrument(skip_all, fields(root = %root.display()))]
pub fn init_project(root: &Path, options: &InitOptions) -> Result<InitReport> {
    let config_path = root.join(CONFIG_FILE_NAME);
    let mut report = InitReport {
        config_path: config_path.clone(),
        created: Vec::new(),
    };

    let cfg = if config_path.exists() {
        load_config(&config_path)?
    } else {
        let cfg = RalphConfig {
            provider: options.provider.clone(),
            model: options.model.clone(),
            ..RalphConfig::default()
        };
        write_config(&config_path, &cfg)?;
        report.created.push(config_path.clone());
        cfg
    };

    let paths = RunPaths::resolve(root, &cfg.dirs);
    for dir in [
        &paths.todo,
        &paths.done,
        &paths.failed,
        &paths.personas,
        &paths.context,
    ] {
        if !dir.is_dir() {
            create_dir(dir)?;
            report.created.push(dir.clone());
        }
    }

    for (name, contents) in SEED_PERSONAS {
        let path = paths.personas.join(name);
        if !path.exists() {
            write_file(&path, contents)?;
            report.created.push(path);
        }
    }

    let pattern = cfg.dirs.context.to_string_lossy().replace('\\', "/");
    if ensure_ignored(&root.join(".gitignore"), &pattern)? {
        report.created.push(root.join(".gitignore"));
    }

    debug!(created = report.created.len(), "init complete");
    Ok(report)
}

/// Add `pattern` to `.gitignore` unless already present. Returns true on change.
fn ensure_ignored(gitignore: &Path, pattern: &str) -> Result<bool> {
    if !gitignore.exists() {
        write_file(gitignore, &format!("{pattern}\n"))?;
        return Ok(true);
    }
    let content = fs::read_to_string(gitignore)
        .with_context(|| format!("read {}", gitignore.display()))?;
    if content.lines().any(|line| line.trim() == pattern) {
        return Ok(false);
    }
    let mut updated = content;
    if !updated.is_empty() && !updated.ends_with('\n') {
        updated.push('\n');
    }
    updated.push_str(pattern);
    updated.push('\n');
    write_file(gitignore, &updated)?;
    Ok(true)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_creates_expected_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        let options = InitOptions {
            provider: Some("aider".to_string()),
            model: None,
        };

        let report = init_project(root, &options).expect("init");

        for dir in ["tasks/todo", "tasks/done", "tasks/failed", ".ralph/personas", ".ralph/context"] {
            assert!(root.join(dir).is_dir(), "{dir} missing");
        }
        let architect =
            fs::read_to_string(root.join(".ralph/personas/architect.md")).expect("read");
        assert!(architect.starts_with("ROLE: Software Architect"));
        assert_eq!(
            fs::read_to_string(root.join(".gitignore")).expect("read"),
            ".ralph/context\n"
        );
        let cfg = load_config(&report.config_path).expect("config");
        assert_eq!(cfg.provider.as_deref(), Some("aider"));
    }

    #[test]
    fn init_is_idempotent_and_keeps_user_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        fs::create_dir_all(root.join(".ralph/personas")).expect("mkdir");
        fs::write(root.join(".ralph/personas/ralph.md"), "custom").expect("write");
        fs::write(root.join(".gitignore"), "target").expect("write");

        init_project(root, &InitOptions::default()).expect("first");
        let second = init_project(root, &InitOptions::default()).expect("second");

        assert!(second.created.is_empty());
        assert_eq!(
            fs::read_to_string(root.join(".ralph/personas/ralph.md")).expect("read"),
            "custom"
        );
        assert_eq!(
            fs::read_to_string(root.join(".gitignore")).expect("read"),
            "target\n.ralph/context\n"
        );
    }

    #[test]
    fn init_rejects_unknown_provider() {
        let temp = tempfile::tempdir().expect("tempdir");
        let options = InitOptions {
            provider: Some("nope".to_string()),
            model: None,
        };
        assert!(init_project(temp.path(), &options).is_err());
        assert!(!temp.path().join(CONFIG_FILE_NAME).exists());
    }
}
