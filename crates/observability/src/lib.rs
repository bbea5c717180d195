//! Tracing/logging setup shared by binaries and tests.

pub mod subscriber;

/// Initialize process-wide tracing with JSON output.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    subscriber::init();
}

pub use subscriber::{init_for_tests, init_with_filter};
