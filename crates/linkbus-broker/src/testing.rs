//! In-memory collaborators and link fixtures
//!
//! Compiled for this crate's tests and, behind the `test-utils` feature, for
//! dependent crates.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;

use linkbus_core::{
    positional, DsId, HandshakePayload, RequestMessage, ResponseMessage, SessionId, WireMessage,
    LINK_DATA_TAG,
};
use linkbus_crypto::{
    compute_auth_token, decode_public_key, encode_auth_token, public_key_hash, EphemeralKeyPair, Salt,
    SessionAuthenticator,
};

use crate::{
    ClientSession, ListRequestGenerator, ListSnapshotStream, NodeTree, NoopObserver,
    ProducerLink, SessionRegistry, StreamContext, Transport,
};

/// Transport that records every hand-off
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(SessionId, WireMessage)>>,
    closed: Mutex<Vec<SessionId>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent_to(&self, session: SessionId) -> Vec<WireMessage> {
        self.sent
            .lock()
            .iter()
            .filter(|(id, _)| *id == session)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Responses sent to a session, frames flattened
    pub fn responses_to(&self, session: SessionId) -> Vec<ResponseMessage> {
        self.sent_to(session)
            .into_iter()
            .flat_map(|m| match m {
                WireMessage::Responses(r) => r,
                WireMessage::Requests(_) => Vec::new(),
            })
            .collect()
    }

    /// Requests sent to a session, frames flattened
    pub fn requests_to(&self, session: SessionId) -> Vec<RequestMessage> {
        self.sent_to(session)
            .into_iter()
            .flat_map(|m| match m {
                WireMessage::Requests(r) => r,
                WireMessage::Responses(_) => Vec::new(),
            })
            .collect()
    }

    pub fn closed(&self) -> Vec<SessionId> {
        self.closed.lock().clone()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

impl Transport for RecordingTransport {
    fn send(&self, session: &ClientSession, message: WireMessage) {
        self.sent.lock().push((session.id(), message));
    }

    fn close(&self, session: &ClientSession) {
        self.closed.lock().push(session.id());
    }
}

/// Tree placing every link at `/downstream/<name>`
#[derive(Default)]
pub struct StaticTree {
    assigned: AtomicUsize,
    confirmed: Mutex<Vec<SessionId>>,
    released: Mutex<Vec<SessionId>>,
}

impl StaticTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Paths handed out so far
    pub fn assigned(&self) -> usize {
        self.assigned.load(Ordering::Relaxed)
    }

    /// Sessions whose path was confirmed, in order
    pub fn confirmed(&self) -> Vec<SessionId> {
        self.confirmed.lock().clone()
    }

    /// Sessions whose reservation was given back, in order
    pub fn released(&self) -> Vec<SessionId> {
        self.released.lock().clone()
    }
}

impl NodeTree for StaticTree {
    fn assign_offline_path(&self, ds_id: &DsId) -> String {
        self.assigned.fetch_add(1, Ordering::Relaxed);
        format!("/downstream/{}", ds_id.display_name())
    }

    fn confirm_path(&self, session: &ClientSession) {
        self.confirmed.lock().push(session.id());
    }

    fn release_path(&self, session: &ClientSession) {
        self.released.lock().push(session.id());
    }

    fn root_link_data_update(&self, session: &ClientSession) -> Option<Value> {
        session
            .link_data()
            .map(|data| positional(LINK_DATA_TAG, data.clone()))
    }
}

/// Link side of a handshake
pub struct TestLink {
    name: String,
    key: EphemeralKeyPair,
    is_requester: Option<bool>,
    is_responder: Option<bool>,
    link_data: Option<Value>,
}

impl TestLink {
    pub fn new(name: &str, is_requester: Option<bool>, is_responder: Option<bool>) -> Self {
        TestLink {
            name: name.to_string(),
            key: SessionAuthenticator::new().generate_ephemeral_key_pair(),
            is_requester,
            is_responder,
            link_data: None,
        }
    }

    pub fn requester(name: &str) -> Self {
        Self::new(name, Some(true), None)
    }

    pub fn responder(name: &str) -> Self {
        Self::new(name, None, Some(true))
    }

    pub fn with_link_data(mut self, data: Value) -> Self {
        self.link_data = Some(data);
        self
    }

    pub fn public_key(&self) -> String {
        self.key.public_key_string()
    }

    /// `<name>-<hash of public key>`
    pub fn ds_id(&self) -> DsId {
        decode_public_key(&self.public_key())
            .and_then(|key| DsId::compose(&self.name, &public_key_hash(&key)))
            .unwrap_or_else(|e| panic!("test link {:?}: {}", self.name, e))
    }

    pub fn payload(&self) -> HandshakePayload {
        HandshakePayload {
            public_key: self.public_key(),
            is_requester: self.is_requester,
            is_responder: self.is_responder,
            link_data: self.link_data.clone(),
            version: Some("1.1.2".to_string()),
        }
    }

    /// Token proving the link derived the same secret as the broker
    pub fn auth_token(&self, temp_key: &str, salt: &Salt) -> String {
        let secret = SessionAuthenticator::new()
            .derive_shared_secret(&self.key, temp_key)
            .unwrap_or_else(|e| panic!("broker temp key rejected: {}", e));
        encode_auth_token(&compute_auth_token(salt, &secret))
    }

    /// Same as [`auth_token`](Self::auth_token), from the salt text on the wire
    pub fn auth_token_for(&self, temp_key: &str, salt: &str) -> String {
        self.auth_token(temp_key, &Salt::from_encoded(salt))
    }
}

/// Registry wired to recording collaborators
pub struct Fixture {
    pub authenticator: Arc<SessionAuthenticator>,
    pub tree: Arc<StaticTree>,
    pub transport: Arc<RecordingTransport>,
    pub registry: SessionRegistry,
    producers: DashMap<String, Arc<ProducerLink>>,
}

impl Fixture {
    pub fn new() -> Self {
        let authenticator = Arc::new(SessionAuthenticator::new());
        let tree = Arc::new(StaticTree::new());
        let transport = Arc::new(RecordingTransport::new());
        let registry = SessionRegistry::new(
            authenticator.clone(),
            tree.clone(),
            transport.clone(),
            Arc::new(NoopObserver),
        );
        Fixture {
            authenticator,
            tree,
            transport,
            registry,
            producers: DashMap::new(),
        }
    }

    pub fn context(&self) -> StreamContext {
        StreamContext {
            tree: self.tree.clone(),
            requests: Arc::new(ListRequestGenerator),
            transport: self.transport.clone(),
        }
    }

    /// Handshake and authenticate a link
    pub fn connect(&self, link: &TestLink) -> Arc<ClientSession> {
        let session = self
            .registry
            .register_new_session(link.ds_id().as_str(), &link.payload())
            .expect("handshake");
        let temp_key = session.temp_public_key().expect("temp key");
        let salt = session.salt().expect("salt");
        let token = link.auth_token(&temp_key, &salt);
        self.registry
            .session_connected(&session, Some(&token))
            .expect("authentication");
        session
    }

    /// Producer link named after the session, shared across calls
    pub fn producer(&self, name: &str) -> Arc<ProducerLink> {
        self.producers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(ProducerLink::new(name)))
            .value()
            .clone()
    }

    /// Fresh list stream on `path`, its producer link bound to `producer`
    pub fn list_stream(&self, producer: &Arc<ClientSession>, path: &str) -> Arc<ListSnapshotStream> {
        let link = self.producer(producer.name());
        link.bind(producer.clone());
        ListSnapshotStream::new(path, link, self.context())
    }
}

impl Default for Fixture {
    fn default() -> Self {
        Self::new()
    }
}
