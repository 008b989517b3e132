//! Troupe Testing Infrastructure
//!
//! Helpers shared by the integration tests of the troupe crates: a handful of
//! scenario choreographies exercising timeouts, retries and failure handling,
//! a transport that loses messages on purpose, and tracing setup.
//!
//! # Usage
//!
//! ```toml
//! [dev-dependencies]
//! troupe-testkit = { path = "../troupe-testkit" }
//! ```

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

pub mod scenarios;
pub mod transport;

pub use scenarios::*;
pub use transport::LossyTransport;

/// Install a test-friendly subscriber once; later calls are no-ops.
///
/// The filter comes from `RUST_LOG`, defaulting to `info`.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(filter)
        .try_init();
}
