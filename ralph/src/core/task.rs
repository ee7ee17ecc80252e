//! In-memory representation of a task file.

use crate::core::frontmatter::{self, Frontmatter};
use crate::error::TaskError;

/// A unit of work parsed from `<todo>/<file_name>`.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    /// Stable identifier (the file name, including `.md`).
    pub file_name: String,
    pub frontmatter: Frontmatter,
    pub body: String,
    /// Original file content, preserved verbatim for the audit log.
    pub raw: String,
}

impl Task {
    /// Parse raw task content.
    pub fn parse(file_name: impl Into<String>, raw: impl Into<String>) -> Result<Self, TaskError> {
        let file_name = file_name.into();
        let raw = raw.into();
        let (frontmatter, body) =
            frontmatter::parse(&raw).map_err(|reason| TaskError::Parse {
                file_name: file_name.clone(),
                reason,
            })?;
        let body = body.to_string();
        Ok(Self {
            file_name,
            frontmatter,
            body,
            raw,
        })
    }

    /// `task_id` from frontmatter, falling back to the file stem.
    pub fn id(&self) -> &str {
        self.frontmatter
            .task_id
            .as_deref()
            .unwrap_or_else(|| self.file_stem())
    }

    pub fn file_stem(&self) -> &str {
        self.file_name
            .strip_suffix(".md")
            .unwrap_or(&self.file_name)
    }

    /// The validation command, required before any attempt runs.
    pub fn validation_cmd(&self) -> Result<&str, TaskError> {
        self.frontmatter
            .validation_cmd
            .as_deref()
            .map(str::trim)
            .filter(|cmd| !cmd.is_empty())
            .ok_or_else(|| TaskError::MissingField {
                file_name: self.file_name.clone(),
                field: "validation_cmd",
            })
    }

    pub fn affected_files(&self) -> &[String] {
        &self.frontmatter.affected_files
    }
}
