//! Side-effecting operations: filesystem, git, and child processes.

pub mod agent;
pub mod config;
pub mod context;
pub mod git;
pub mod init;
pub mod process;
pub mod providers;
pub mod task_store;
pub mod validation;
