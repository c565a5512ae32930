//! Tracing/logging initialization.
//!
//! JSON lines with timestamps, filtered by `RUST_LOG`. Targets are kept in the
//! output so settlement fallbacks (`settlement.fallback`) and unpaid rewards
//! (`settlement.unsettled`) can be told apart from the primary payout path.

use tracing_subscriber::EnvFilter;

pub const DEFAULT_FILTER: &str = "info";

/// Install the global subscriber. `default_filter` applies when `RUST_LOG` is
/// unset or unparsable.
pub fn init(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_is_a_no_op() {
        init(DEFAULT_FILTER);
        init("debug");
        ::tracing::info!(target: "settlement.fallback", "still logging");
    }
}
