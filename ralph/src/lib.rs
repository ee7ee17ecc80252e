//! Propose → validate → commit loop for external AI coding agents.
//!
//! `ralph` works through a queue of Markdown task files. For each task it
//! renders a context file, hands it to an agent CLI (gemini, aider, ...),
//! runs the task's validation command, and on success moves the task to
//! `done/` and commits. The layout follows a strict split:
//!
//! - **[`core`]**: Pure logic (frontmatter parsing, attempt records, commit
//!   messages). No I/O.
//! - **[`io`]**: Side effects (task files, context rendering, processes, git,
//!   configuration).
//!
//! [`engine`] wires the two together and reports progress through
//! [`observer`] events.

pub mod core;
pub mod engine;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod observer;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
