//! Client sessions
//!
//! A `ClientSession` is assembled by [`SessionBuilder`] once every piece of
//! the handshake is known and is immutable afterwards. Only the secrets are
//! mutable, and only in one direction: `close` wipes them.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde_json::Value;

use linkbus_core::{BrokerError, BrokerResult, DsId, HandshakePayload, SessionId};
use linkbus_crypto::{EphemeralKeyPair, Salt, SessionAuthenticator, SharedSecret};

use crate::{RequesterStreams, ResponderStreams};

/// Key material owned by one session
struct SessionSecrets {
    salt: Salt,
    shared_secret: SharedSecret,
    temp_key: EphemeralKeyPair,
}

/// One connected party
pub struct ClientSession {
    id: SessionId,
    ds_id: DsId,
    public_key: String,
    is_requester: bool,
    is_responder: bool,
    link_data: Option<Value>,
    protocol_version: Option<String>,
    path: String,
    secrets: Mutex<Option<SessionSecrets>>,
    closed: AtomicBool,
    requester: RequesterStreams,
    responder: ResponderStreams,
}

impl ClientSession {
    /// Broker-assigned connection id
    #[inline]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[inline]
    pub fn ds_id(&self) -> &DsId {
        &self.ds_id
    }

    /// Display name taken from the identifier
    #[inline]
    pub fn name(&self) -> &str {
        self.ds_id.display_name()
    }

    #[inline]
    pub fn pub_key_hash(&self) -> &str {
        self.ds_id.hash_segment()
    }

    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    pub fn is_requester(&self) -> bool {
        self.is_requester
    }

    pub fn is_responder(&self) -> bool {
        self.is_responder
    }

    pub fn link_data(&self) -> Option<&Value> {
        self.link_data.as_ref()
    }

    pub fn protocol_version(&self) -> Option<&str> {
        self.protocol_version.as_deref()
    }

    /// Tree path assigned at registration
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Salt sent in the handshake reply; `None` once closed
    pub fn salt(&self) -> Option<Salt> {
        self.secrets.lock().as_ref().map(|s| s.salt.clone())
    }

    /// Independent copy of the shared secret; `None` once closed
    pub fn shared_secret(&self) -> Option<SharedSecret> {
        self.secrets
            .lock()
            .as_ref()
            .map(|s| s.shared_secret.clone())
    }

    /// Broker ephemeral public key sent to the peer as `tempKey`
    pub fn temp_public_key(&self) -> Option<String> {
        self.secrets
            .lock()
            .as_ref()
            .map(|s| s.temp_key.public_key_string())
    }

    /// Check the token the peer presents after the handshake
    pub fn validate(&self, authenticator: &SessionAuthenticator, auth: Option<&str>) -> bool {
        let secrets = self.secrets.lock();
        match secrets.as_ref() {
            Some(s) => authenticator.validate_auth_token(auth, &s.salt, &s.shared_secret),
            None => false,
        }
    }

    /// Streams this session has requested, by its own rids
    pub fn requester_streams(&self) -> &RequesterStreams {
        &self.requester
    }

    /// Upstream requests the broker has sent to this session
    pub fn responder_streams(&self) -> &ResponderStreams {
        &self.responder
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wipe secrets and drop request tables
    ///
    /// Returns `true` the first time only.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.secrets.lock().take();
        self.requester.clear();
        self.responder.clear();
        true
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id)
            .field("ds_id", &self.ds_id)
            .field("path", &self.path)
            .field("requester", &self.is_requester)
            .field("responder", &self.is_responder)
            .finish_non_exhaustive()
    }
}

/// Staged construction of a [`ClientSession`]
pub struct SessionBuilder {
    id: SessionId,
    ds_id: DsId,
    public_key: Option<String>,
    is_requester: bool,
    is_responder: bool,
    link_data: Option<Value>,
    protocol_version: Option<String>,
    path: Option<String>,
    salt: Option<Salt>,
    keys: Option<(EphemeralKeyPair, SharedSecret)>,
}

impl SessionBuilder {
    pub fn new(id: SessionId, ds_id: DsId) -> Self {
        SessionBuilder {
            id,
            ds_id,
            public_key: None,
            is_requester: false,
            is_responder: false,
            link_data: None,
            protocol_version: None,
            path: None,
            salt: None,
            keys: None,
        }
    }

    pub fn ds_id(&self) -> &DsId {
        &self.ds_id
    }

    /// Copy the peer-declared fields; absent capability flags are false
    pub fn handshake(mut self, payload: &HandshakePayload) -> Self {
        self.public_key = Some(payload.public_key.clone());
        self.is_requester = payload.is_requester.unwrap_or(false);
        self.is_responder = payload.is_responder.unwrap_or(false);
        self.link_data = payload.link_data.clone();
        self.protocol_version = payload.version.clone();
        self
    }

    pub fn salt(mut self, salt: Salt) -> Self {
        self.salt = Some(salt);
        self
    }

    pub fn path(mut self, path: String) -> Self {
        self.path = Some(path);
        self
    }

    pub fn keys(mut self, temp_key: EphemeralKeyPair, shared_secret: SharedSecret) -> Self {
        self.keys = Some((temp_key, shared_secret));
        self
    }

    pub fn build(self) -> BrokerResult<ClientSession> {
        let public_key = self
            .public_key
            .filter(|k| !k.is_empty())
            .ok_or(BrokerError::MissingField("publicKey"))?;
        let salt = self.salt.ok_or(BrokerError::MissingField("salt"))?;
        let path = self.path.ok_or(BrokerError::MissingField("path"))?;
        let (temp_key, shared_secret) = self.keys.ok_or(BrokerError::MissingField("sharedSecret"))?;

        Ok(ClientSession {
            id: self.id,
            ds_id: self.ds_id,
            public_key,
            is_requester: self.is_requester,
            is_responder: self.is_responder,
            link_data: self.link_data,
            protocol_version: self.protocol_version,
            path,
            secrets: Mutex::new(Some(SessionSecrets {
                salt,
                shared_secret,
                temp_key,
            })),
            closed: AtomicBool::new(false),
            requester: RequesterStreams::new(),
            responder: ResponderStreams::new(),
        })
    }
}
