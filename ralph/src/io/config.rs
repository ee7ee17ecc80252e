//! Run configuration stored in `ralph.toml` at the project root.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::io::agent::DEFAULT_OUTPUT_LIMIT_BYTES;
use crate::io::providers::{ProviderDefinition, ProviderRegistry};

pub const CONFIG_FILE_NAME: &str = "ralph.toml";

/// Run configuration (TOML).
///
/// Every key is optional; missing keys fall back to the defaults below.
/// Directory paths are relative to the project root.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RalphConfig {
    /// Provider used when a task does not name one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    /// Model used when neither the task nor the provider names one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Persona used when a task does not name one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,

    /// Attempts per task.
    pub retries: u32,

    /// Agent output kept per attempt for the audit log.
    pub agent_output_limit_bytes: usize,

    pub dirs: DirsConfig,

    pub timeouts: TimeoutsConfig,

    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub providers: BTreeMap<String, ProviderDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DirsConfig {
    pub todo: PathBuf,
    pub done: PathBuf,
    pub failed: PathBuf,
    pub personas: PathBuf,
    /// Holds the generated context file; should be gitignored.
    pub context: PathBuf,
}

/// Timeouts in milliseconds; 0 disables the timeout.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub agent_ms: u64,
    pub validation_ms: u64,
}

impl TimeoutsConfig {
    pub fn agent(&self) -> Duration {
        Duration::from_millis(self.agent_ms)
    }

    pub fn validation(&self) -> Duration {
        Duration::from_millis(self.validation_ms)
    }
}

impl Default for DirsConfig {
    fn default() -> Self {
        Self {
            todo: PathBuf::from("tasks/todo"),
            done: PathBuf::from("tasks/done"),
            failed: PathBuf::from("tasks/failed"),
            personas: PathBuf::from(".ralph/personas"),
            context: PathBuf::from(".ralph/context"),
        }
    }
}

impl Default for RalphConfig {
    fn default() -> Self {
        Self {
            provider: None,
            model: None,
            persona: None,
            retries: 3,
            agent_output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
            dirs: DirsConfig::default(),
            timeouts: TimeoutsConfig::default(),
            providers: BTreeMap::new(),
        }
    }
}

impl RalphConfig {
    pub fn validate(&self) -> Result<()> {
        if self.retries == 0 {
            return Err(anyhow!("retries must be >= 1"));
        }
        if self.agent_output_limit_bytes == 0 {
            return Err(anyhow!("agent_output_limit_bytes must be > 0"));
        }
        for (key, dir) in [
            ("todo", &self.dirs.todo),
            ("done", &self.dirs.done),
            ("failed", &self.dirs.failed),
            ("personas", &self.dirs.personas),
            ("context", &self.dirs.context),
        ] {
            if dir.as_os_str().is_empty() {
                return Err(anyhow!("dirs.{key} must not be empty"));
            }
        }
        let registry = self.registry()?;
        if let Some(provider) = self.provider.as_deref()
            && registry.get(provider).is_none()
        {
            let known: Vec<&str> = registry.names().collect();
            return Err(anyhow!(
                "unknown provider '{provider}' (known: {})",
                known.join(", ")
            ));
        }
        Ok(())
    }

    /// Built-in providers overlaid with the `[providers]` table.
    pub fn registry(&self) -> Result<ProviderRegistry> {
        ProviderRegistry::with_definitions(&self.providers).context("invalid [providers] table")
    }
}

/// Absolute locations for one run, resolved against the project root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    pub root: PathBuf,
    pub todo: PathBuf,
    pub done: PathBuf,
    pub failed: PathBuf,
    pub personas: PathBuf,
    pub context: PathBuf,
}

impl RunPaths {
    pub fn resolve(root: &Path, dirs: &DirsConfig) -> Self {
        Self {
            root: root.to_path_buf(),
            todo: root.join(&dirs.todo),
            done: root.join(&dirs.done),
            failed: root.join(&dirs.failed),
            personas: root.join(&dirs.personas),
            context: root.join(&dirs.context),
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RalphConfig::default()`.
pub fn load_config(path: &Path) -> Result<RalphConfig> {
    if !path.exists() {
        let cfg = RalphConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RalphConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RalphConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
