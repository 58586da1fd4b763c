//! Shared helpers for the two-end loopback tests.
//!
//! The tests need an RDMA-capable address on this host; a soft-RoCE (rxe)
//! device on the loopback interface works. Override the default with the
//! `RPMA_TEST_ADDR` environment variable.

use portpicker::pick_unused_port;

/// The address the two ends meet on
#[allow(dead_code)] // each test crate uses its own subset of helpers
pub fn test_addr() -> String {
    std::env::var("RPMA_TEST_ADDR").unwrap_or_else(|_| "127.0.0.1".to_owned())
}

/// A free port for one test, as the decimal service string
#[allow(dead_code)]
pub fn pick_service() -> String {
    pick_unused_port().unwrap().to_string()
}

/// Install the fmt collector once per test binary
#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt::try_init();
}
