//! Logging initialization

use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;

/// Install the global tracing subscriber. `RUST_LOG` takes precedence over config.
pub fn init_logging(config: &AppConfig, verbose: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level(verbose)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose >= 2)
        .with_line_number(verbose >= 3)
        .init();

    debug!(verbose, "logging initialized");
}
