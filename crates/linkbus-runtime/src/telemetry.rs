//! Logging setup

use tracing_subscriber::EnvFilter;

use linkbus_core::{BrokerError, BrokerResult};

use crate::LoggingConfig;

/// Filter from `RUST_LOG`, falling back to the configured directives
pub fn env_filter(config: &LoggingConfig) -> BrokerResult<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.filter)
            .map_err(|e| BrokerError::Config(format!("logging filter {:?}: {}", config.filter, e))),
    }
}

/// Install the global subscriber
///
/// Fails if the filter does not parse or a subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> BrokerResult<()> {
    let filter = env_filter(config)?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| BrokerError::Config(format!("logging already initialized: {}", e)))
}
