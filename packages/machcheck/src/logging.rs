//! Log subscriber setup for binaries and tests that drive the checker.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "machcheck=info";

/// Install a global fmt subscriber filtered by `RUST_LOG`.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into()))
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init();
}

/// Like [`init`] but writes through the test harness' captured output.
pub fn init_for_tests() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into()))
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}
