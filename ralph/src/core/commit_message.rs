//! Conventional commit messages derived from a finished task.
//!
//! `<type>(<task_id>): <subject>` where the type comes from the second
//! file-name segment (`0003-fix-login.md` → `fix`) and the subject from the
//! task body.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::task::Task;

const MAX_SUBJECT_CHARS: usize = 72;

static OBJECTIVE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)# Objective\s+([^\n]+)").expect("objective regex should be valid")
});
static H1_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^#\s+([^\n]+)").expect("h1 regex should be valid"));

pub fn derive_commit_message(task: &Task) -> String {
    let kind = commit_type(&task.file_name);
    let subject = subject(task);
    match task.frontmatter.task_id.as_deref().map(str::trim) {
        Some(scope) if !scope.is_empty() => format!("{kind}({scope}): {subject}"),
        _ => format!("{kind}: {subject}"),
    }
}

fn commit_type(file_name: &str) -> &'static str {
    let upper = file_name.to_uppercase();
    let Some(segment) = upper.split('-').nth(1) else {
        return "feat";
    };
    match segment.trim_end_matches(".MD") {
        "FIX" | "BUG" => "fix",
        "TEST" => "test",
        "DOCS" => "docs",
        _ => "feat",
    }
}

fn subject(task: &Task) -> String {
    let from_body = OBJECTIVE_RE
        .captures(&task.body)
        .or_else(|| H1_RE.captures(&task.body))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty());
    let subject = from_body.unwrap_or_else(|| humanize_file_name(&task.file_name));
    truncate(&subject)
}

fn humanize_file_name(file_name: &str) -> String {
    let name = file_name.strip_suffix(".md").unwrap_or(file_name);
    let parts: Vec<&str> = name.split('-').collect();
    // NNNN-TYPE-description drops the sequence number and type.
    if parts.len() >= 3 && parts[0].chars().all(|c| c.is_ascii_digit()) {
        return parts[2..].join(" ");
    }
    name.replace('-', " ")
}

fn truncate(subject: &str) -> String {
    if subject.chars().count() <= MAX_SUBJECT_CHARS {
        return subject.to_string();
    }
    let cut: String = subject.chars().take(MAX_SUBJECT_CHARS).collect();
    format!("{cut}...")
}
