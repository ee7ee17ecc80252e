//! Pure, deterministic logic for ralph: task model, attempt records, model
//! resolution and commit message derivation. No I/O lives here.

pub mod commit_message;
pub mod frontmatter;
pub mod task;
pub mod types;
