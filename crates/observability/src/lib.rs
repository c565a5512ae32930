//! Process-wide tracing/logging setup.

/// Initialize process-wide observability with the default `info` filter.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init(tracing::DEFAULT_FILTER);
}

pub mod tracing;
