//! Tracing and logging setup shared by the service binary and tests.

/// Initialize process-wide tracing with the given output format and level.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init(format: LogFormat, level: &str) {
    tracing::init(format, level);
}

/// Tracing configuration (filters, layers).
pub mod tracing;

pub use self::tracing::{LogFormat, ParseLogFormatError};
