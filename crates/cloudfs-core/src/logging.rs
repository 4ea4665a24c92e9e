//! Tracing bootstrap.
//!
//! The mount adapter calls [`init`] once at startup; the `RUST_LOG`
//! environment variable takes precedence over the configured level.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Installs a global fmt subscriber filtered by `RUST_LOG` or `config.level`.
///
/// Returns `false` if a global subscriber was already installed (for example
/// by a test harness), in which case the existing one is kept.
pub fn init(config: &LoggingConfig) -> bool {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .is_ok()
}
