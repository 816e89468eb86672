//! Structured logging configuration.
//!
//! Thin wrapper over `tracing-subscriber` so binaries embedding the stack
//! get consistent log output. The `RUST_LOG` environment variable
//! overrides the configured level.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Initializes the global tracing subscriber from the logging config.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// Initializes logging with the default configuration.
pub fn init_default() {
    init(&LoggingConfig::default());
}
