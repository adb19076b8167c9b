//! Tracing setup for binaries and tests built on Meshlink.
//!
//! Library code only emits `tracing` events; installing a subscriber is
//! the application's call. This is the one most demos want.

use tracing_subscriber::EnvFilter;

/// Installs a stderr `fmt` subscriber.
///
/// `RUST_LOG` wins when set; otherwise `default_filter` applies
/// (e.g. `"info"` or `"meshlink=debug,warn"`). Calling this twice, or after
/// another subscriber is installed, is a no-op.
pub fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
