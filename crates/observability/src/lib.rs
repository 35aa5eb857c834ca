//! Tracing/logging setup shared by ledger binaries and test suites.

/// Subscriber initialization (filters, formatting).
pub mod subscriber;

/// Initialize process-wide JSON logging, filtered by `RUST_LOG` (default `info`).
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    subscriber::init_json();
}

/// Initialize human-readable logging captured by the test harness.
///
/// Safe to call from every test; only the first call installs a subscriber.
pub fn init_for_tests() {
    subscriber::init_test();
}
