//! Tracing initialization shared by the sync binaries.

use tracing::info;
use tracing_subscriber::EnvFilter;

/// Initializes the global tracing subscriber for a binary.
///
/// The filter is taken from `RUST_LOG` when set, falling back to `info` for
/// all targets. Initialization is idempotent: calling this twice (as happens
/// in tests) leaves the first subscriber in place.
pub fn init_tracing(service_name: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let result = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();

    if result.is_ok() {
        info!("tracing initialized for service '{}'", service_name);
    }
}
