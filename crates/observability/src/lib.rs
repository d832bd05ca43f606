//! Tracing setup shared by binaries and tests that embed the client.

/// Tracing configuration (filters, formatters).
pub mod tracing;

pub use crate::tracing::{LogFormat, init, init_with};

/// Install a compact subscriber that writes through the test harness.
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_for_tests() {
    crate::tracing::init_test_writer();
}
