//! Log output setup.

use tracing_subscriber::EnvFilter;

/// Installs a formatted subscriber filtered by `RUST_LOG`, defaulting to
/// `info`. Calling it again after a subscriber is installed does nothing.
pub fn init() {
    init_with_default("info");
}

/// Like [`init`], with a different fallback when `RUST_LOG` is unset.
pub fn init_with_default(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(true).try_init();
}
