//! Tracing setup for the `ralph` binary.
//!
//! Everything goes to stderr so agent output streamed to stdout stays clean.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const DEFAULT_LEVEL: &str = "info";

/// Initialize the global subscriber.
///
/// An explicit `level` (from `--debug`/`--quiet`) wins; otherwise `RUST_LOG`
/// is honored, falling back to `info`.
///
/// # Example
/// ```bash
/// RUST_LOG=ralph=debug ralph run --task 0002
/// ```
pub fn init(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LEVEL)),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
