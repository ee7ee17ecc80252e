//! Context builder: assembles the prompt handed to the agent.
//!
//! The context is written to a single-slot file (`<context_dir>/current_task.md`)
//! that is overwritten on every attempt; only one task is ever in flight.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use tracing::{debug, warn};

use crate::core::frontmatter::Frontmatter;
use crate::core::task::Task;
use crate::core::types::{AttemptRecord, render_history};

const CONTEXT_TEMPLATE: &str = include_str!("templates/context.md");
pub const DEFAULT_PERSONA: &str = include_str!("templates/default_persona.md");
pub const CONTEXT_FILE_NAME: &str = "current_task.md";

pub struct ContextBuilder {
    personas_dir: PathBuf,
    context_path: PathBuf,
    default_persona: Option<String>,
    env: Environment<'static>,
}

impl ContextBuilder {
    /// `default_persona` is the run-level persona name (from config), if any.
    pub fn new(
        personas_dir: impl Into<PathBuf>,
        context_dir: impl AsRef<Path>,
        default_persona: Option<String>,
    ) -> Self {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.add_template("context", CONTEXT_TEMPLATE)
            .expect("context template should be valid");
        Self {
            personas_dir: personas_dir.into(),
            context_path: context_dir.as_ref().join(CONTEXT_FILE_NAME),
            default_persona,
            env,
        }
    }

    pub fn context_path(&self) -> &Path {
        &self.context_path
    }

    /// Persona text: task persona, then run default, then the built-in persona.
    pub fn resolve_persona(&self, frontmatter: &Frontmatter) -> String {
        let name = frontmatter
            .persona
            .as_deref()
            .or(self.default_persona.as_deref())
            .map(str::trim)
            .filter(|n| !n.is_empty());
        let Some(name) = name else {
            return DEFAULT_PERSONA.to_string();
        };
        if name.contains(['/', '\\']) {
            warn!(persona = name, "persona names must not contain path separators, using default");
            return DEFAULT_PERSONA.to_string();
        }

        let path = self.personas_dir.join(format!("{name}.md"));
        match fs::read_to_string(&path) {
            Ok(contents) => {
                debug!(persona = name, "loaded persona");
                contents
            }
            Err(err) => {
                warn!(
                    persona = name,
                    path = %path.display(),
                    err = %err,
                    "persona file not found, using default"
                );
                DEFAULT_PERSONA.to_string()
            }
        }
    }

    /// Render the context text without writing it.
    pub fn render(&self, task: &Task, history: &[AttemptRecord]) -> Result<String> {
        let persona = self.resolve_persona(&task.frontmatter);
        let validation_cmd = task
            .frontmatter
            .validation_cmd
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());
        let history = render_history(history);
        let template = self.env.get_template("context")?;
        let rendered = template
            .render(context! {
                persona => persona.trim(),
                body => task.body.trim(),
                validation_cmd => validation_cmd,
                affected_files => task.affected_files(),
                history => history.trim(),
            })
            .with_context(|| format!("render context for {}", task.file_name))?;
        Ok(rendered)
    }

    /// Render the context and write it to the context slot, returning its path.
    pub fn build(&self, task: &Task, history: &[AttemptRecord]) -> Result<PathBuf> {
        let rendered = self.render(task, history)?;
        if let Some(parent) = self.context_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create context dir {}", parent.display()))?;
        }
        fs::write(&self.context_path, rendered)
            .with_context(|| format!("write {}", self.context_path.display()))?;
        debug!(
            path = %self.context_path.display(),
            attempts = history.len(),
            "context written"
        );
        Ok(self.context_path.clone())
    }
}
