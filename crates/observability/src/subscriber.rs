//! Subscriber initialization.
//!
//! The filter comes from `RUST_LOG` when set. Only the first successful
//! initialization in a process takes effect.

use tracing_subscriber::EnvFilter;

/// JSON logs with timestamps, filtered by `RUST_LOG` (default `info`).
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    install_json(filter);
}

/// JSON logs filtered by `directive` (e.g. `narrator_infra=debug,warn`).
///
/// An unparseable directive falls back to `info`. Returns whether this call
/// installed the global subscriber.
pub fn init_with_filter(directive: &str) -> bool {
    let filter = EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("info"));
    install_json(filter)
}

/// Human-readable logs captured by the test harness (default level `warn`).
pub fn init_for_tests() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .compact()
        .try_init();
}

fn install_json(filter: EnvFilter) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init()
        .map(|()| tracing::debug!("json tracing installed"))
        .is_ok()
}
