//! Tracing subscriber setup for the binary.
//!
//! Logs go to stderr so stdout stays reserved for JSON envelopes.

use crate::core::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

pub const LOG_ENV_VAR: &str = "GATEHOUSE_LOG";

/// Install the global subscriber. Safe to call more than once; later calls are no-ops.
pub fn init(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_env(LOG_ENV_VAR)
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);

    let _ = if config.format == "json" {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
