//! Handshake payloads

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{BrokerError, BrokerResult};

/// Connection request sent by a link before it opens its data channel
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakePayload {
    #[serde(default)]
    pub public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_requester: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_responder: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl HandshakePayload {
    /// Parse a handshake body, rejecting malformed JSON and a missing key
    pub fn from_json(body: &str) -> BrokerResult<Self> {
        let payload: HandshakePayload = serde_json::from_str(body)
            .map_err(|e| BrokerError::UnsupportedMessage(e.to_string()))?;
        payload.validate()?;
        Ok(payload)
    }

    /// Check the required fields
    pub fn validate(&self) -> BrokerResult<()> {
        if self.public_key.is_empty() {
            return Err(BrokerError::MissingField("publicKey"));
        }
        if let Some(data) = &self.link_data {
            if !data.is_object() {
                return Err(BrokerError::UnsupportedMessage(
                    "linkData must be an object".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Broker reply to a successful handshake
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResponse {
    /// Broker identifier
    pub id: String,
    /// Broker ephemeral public key (same as `temp_key`)
    pub public_key: String,
    pub ws_uri: String,
    /// Broker ephemeral public key for this connection
    pub temp_key: String,
    /// Salt the link must hash with the shared secret
    pub salt: String,
    /// Tree path assigned to the link
    pub path: String,
    pub version: String,
}
