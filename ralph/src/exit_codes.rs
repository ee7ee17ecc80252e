//! Stable exit codes for `ralph` commands.

/// Command succeeded; for `run`, every processed task is done.
pub const OK: i32 = 0;
/// Invalid config, unknown task, dirty worktree or another run-level error.
pub const INVALID: i32 = 1;
/// `ralph run` finished but at least one task ended in `failed/`.
pub const TASK_FAILED: i32 = 2;
