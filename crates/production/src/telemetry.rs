//! Tracing setup for production processes.

use tracing_subscriber::EnvFilter;

/// Initialize structured logging.
///
/// Honours `RUST_LOG`; defaults to `info` for the totem crates and
/// `warn` elsewhere. Safe to call more than once (later calls are
/// no-ops), so binaries and tests can share it.
pub fn init_telemetry() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,totem=info,totem_production=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
