//! YAML frontmatter parsing for task files.
//!
//! A task file is an optional `---` delimited YAML block followed by a
//! free-text Markdown body. Files without the opening delimiter are treated as
//! all body.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, de};
use serde_yaml::Value;

static FILE_LIST_SPLIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"["'\s,]+"#).expect("file list regex should be valid"));

/// Recognized task metadata. Unknown keys are preserved in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Frontmatter {
    #[serde(default, deserialize_with = "scalar_string")]
    pub task_id: Option<String>,
    #[serde(default, deserialize_with = "scalar_string")]
    pub validation_cmd: Option<String>,
    #[serde(default, deserialize_with = "file_list")]
    pub affected_files: Vec<String>,
    #[serde(default, deserialize_with = "scalar_string")]
    pub provider: Option<String>,
    #[serde(default, deserialize_with = "scalar_string")]
    pub model: Option<String>,
    #[serde(default, deserialize_with = "scalar_string")]
    pub persona: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Split a document into (frontmatter, body).
///
/// Returns `Ok((None, contents))` when the document does not open with `---`,
/// and an error when the block is never closed.
pub fn split(contents: &str) -> Result<(Option<&str>, &str), String> {
    let Some(after_open) = contents
        .strip_prefix("---\n")
        .or_else(|| contents.strip_prefix("---\r\n"))
    else {
        return Ok((None, contents));
    };

    let mut offset = 0usize;
    for line in after_open.split_inclusive('\n') {
        if line.trim_end_matches(['\r', '\n']) == "---" {
            let yaml = &after_open[..offset];
            let body = &after_open[offset + line.len()..];
            return Ok((Some(yaml), body));
        }
        offset += line.len();
    }
    Err("frontmatter block is not closed with '---'".to_string())
}

/// Parse frontmatter and return it with the body that follows.
pub fn parse(contents: &str) -> Result<(Frontmatter, &str), String> {
    let (yaml, body) = split(contents)?;
    let frontmatter = match yaml {
        Some(yaml) if !yaml.trim().is_empty() => {
            serde_yaml::from_str(yaml).map_err(|err| err.to_string())?
        }
        _ => Frontmatter::default(),
    };
    Ok((frontmatter, body))
}

/// Split a delimiter-separated path list (`"a.rs, b.rs"` or `a.rs b.rs`).
pub fn split_file_list(raw: &str) -> Vec<String> {
    FILE_LIST_SPLIT
        .split(raw)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn scalar_to_string(value: Value) -> Result<Option<String>, String> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        Value::Bool(b) => Ok(Some(b.to_string())),
        other => Err(format!("expected a scalar value, got {other:?}")),
    }
}

fn scalar_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    scalar_to_string(value).map_err(de::Error::custom)
}

fn file_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(Vec::new()),
        Value::Sequence(items) => {
            let mut files = Vec::with_capacity(items.len());
            for item in items {
                if let Some(path) = scalar_to_string(item).map_err(de::Error::custom)? {
                    let path = path.trim();
                    if !path.is_empty() {
                        files.push(path.to_string());
                    }
                }
            }
            Ok(files)
        }
        other => {
            let raw = scalar_to_string(other).map_err(de::Error::custom)?;
            Ok(raw.as_deref().map(split_file_list).unwrap_or_default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_keys_and_body() {
        let doc = "---\ntask_id: T-1\nvalidation_cmd: \"cargo test\"\naffected_files:\n  - src/lib.rs\n  - src/main.rs\nprovider: aider\n---\n# Fix it\n";
        let (fm, body) = parse(doc).expect("parse");
        assert_eq!(fm.task_id.as_deref(), Some("T-1"));
        assert_eq!(fm.validation_cmd.as_deref(), Some("cargo test"));
        assert_eq!(fm.affected_files, vec!["src/lib.rs", "src/main.rs"]);
        assert_eq!(fm.provider.as_deref(), Some("aider"));
        assert_eq!(body, "# Fix it\n");
    }

    #[test]
    fn accepts_numeric_task_id_and_string_file_list() {
        let doc = "---\ntask_id: 42\naffected_files: \"a.rs, b.rs c.rs\"\n---\nbody";
        let (fm, _) = parse(doc).expect("parse");
        assert_eq!(fm.task_id.as_deref(), Some("42"));
        assert_eq!(fm.affected_files, vec!["a.rs", "b.rs", "c.rs"]);
    }

    #[test]
    fn keeps_unknown_keys() {
        let doc = "---\npriority: high\n---\nbody";
        let (fm, _) = parse(doc).expect("parse");
        assert_eq!(
            fm.extra.get("priority"),
            Some(&Value::String("high".to_string()))
        );
    }

    #[test]
    fn document_without_frontmatter_is_all_body() {
        let (fm, body) = parse("# Just a body\n").expect("parse");
        assert_eq!(fm, Frontmatter::default());
        assert_eq!(body, "# Just a body\n");
    }

    #[test]
    fn empty_block_yields_defaults() {
        let (fm, body) = parse("---\n---\nbody").expect("parse");
        assert_eq!(fm, Frontmatter::default());
        assert_eq!(body, "body");
    }

    #[test]
    fn unterminated_block_is_an_error() {
        let err = parse("---\ntask_id: x\n# no close\n").unwrap_err();
        assert!(err.contains("not closed"));
    }

    #[test]
    fn invalid_yaml_is_an_error() {
        assert!(parse("---\ntask_id: [unclosed\n---\nbody").is_err());
    }

    #[test]
    fn nested_value_for_scalar_key_is_an_error() {
        assert!(parse("---\nmodel:\n  name: x\n---\nbody").is_err());
    }
}
