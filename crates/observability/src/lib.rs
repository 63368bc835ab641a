//! Process-wide tracing setup shared by every execq binary.

pub mod tracing;

pub use crate::tracing::{LogFormat, TracingConfig};

/// Initialize tracing with the default configuration (JSON, `RUST_LOG` or `info`).
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init(TracingConfig::from_env());
}
