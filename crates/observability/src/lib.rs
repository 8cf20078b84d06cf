//! Tracing and logging setup shared by every pipeline process.

/// Initialize process-wide logging with defaults (JSON, `info`).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init_with(&LoggingConfig::default());
}

/// Tracing configuration (filters, layers).
pub mod tracing;

pub use self::tracing::{LogFormat, LoggingConfig, init_with};
