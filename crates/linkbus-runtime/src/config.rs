//! Broker configuration

use serde::{Deserialize, Serialize};

use linkbus_core::{BrokerError, BrokerResult};

/// Broker configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Identifier returned to links as `id`
    pub broker_id: String,
    /// Data channel endpoint returned to links as `wsUri`
    pub ws_uri: String,
    pub protocol_version: String,
    /// Tree node links are mounted under
    pub downstream_prefix: String,
    /// Reject identifiers whose hash segment does not match the declared key
    pub require_key_binding: bool,
    /// Outbound frames queued per connection before it is dropped
    pub transport_buffer: usize,
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directives; `RUST_LOG` takes precedence
    pub filter: String,
    /// Emit JSON lines instead of human-readable text
    pub json: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            broker_id: "linkbus-broker".to_string(),
            ws_uri: "/ws".to_string(),
            protocol_version: "1.1.2".to_string(),
            downstream_prefix: "/downstream".to_string(),
            require_key_binding: false,
            transport_buffer: 1024,
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            filter: "info".to_string(),
            json: false,
        }
    }
}

impl BrokerConfig {
    /// Parse a JSON document; absent fields keep their defaults
    pub fn from_json_str(json: &str) -> BrokerResult<Self> {
        let config: BrokerConfig =
            serde_json::from_str(json).map_err(|e| BrokerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> BrokerResult<()> {
        let prefix = &self.downstream_prefix;
        if prefix.is_empty() || !prefix.starts_with('/') {
            return Err(BrokerError::Config(format!(
                "downstream_prefix must be an absolute path, got {:?}",
                prefix
            )));
        }
        if prefix.len() > 1 && prefix.ends_with('/') {
            return Err(BrokerError::Config(format!(
                "downstream_prefix must not end with '/', got {:?}",
                prefix
            )));
        }
        if self.transport_buffer == 0 {
            return Err(BrokerError::Config("transport_buffer must be positive".to_string()));
        }
        Ok(())
    }
}
