//! Tracing and logging (shared setup).

/// Initialize process-wide tracing/logging.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init(config: &LogConfig) {
    tracing::init(config);
}

/// Log output configuration.
pub mod logging;

/// Tracing subscriber installation.
pub mod tracing;

pub use logging::{LogConfig, LogFormat};
