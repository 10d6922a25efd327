//! Error types for the broker

use thiserror::Error;

/// Core broker errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    // Protocol violations
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Unsupported message: {0}")]
    UnsupportedMessage(String),

    // Authentication errors
    #[error("Invalid key material: {0}")]
    InvalidKeyMaterial(String),

    #[error("Authentication failed")]
    AuthenticationFailed,

    // Registry errors
    #[error("Session not found")]
    SessionNotFound,

    #[error("Path not found: {0}")]
    PathNotFound(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

impl BrokerError {
    /// Whether the connection attempt that produced this error must be closed.
    ///
    /// Protocol violations and authentication failures are fatal; lookups
    /// and configuration problems are reported to the caller only.
    pub fn rejects_connection(&self) -> bool {
        matches!(
            self,
            BrokerError::InvalidIdentifier(_)
                | BrokerError::MissingField(_)
                | BrokerError::UnsupportedMessage(_)
                | BrokerError::InvalidKeyMaterial(_)
                | BrokerError::AuthenticationFailed
        )
    }
}

/// Result type for broker operations
pub type BrokerResult<T> = Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_connection() {
        assert!(BrokerError::AuthenticationFailed.rejects_connection());
        assert!(BrokerError::InvalidIdentifier("x".into()).rejects_connection());
        assert!(BrokerError::InvalidKeyMaterial("x".into()).rejects_connection());
        assert!(!BrokerError::SessionNotFound.rejects_connection());
        assert!(!BrokerError::Config("x".into()).rejects_connection());
    }
}
