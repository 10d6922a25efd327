//! Session registry
//!
//! Owns every live session from handshake to disconnect and reports the
//! transitions to a [`SessionObserver`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use linkbus_core::{BrokerError, BrokerResult, DsId, HandshakePayload, SessionId};
use linkbus_crypto::{decode_public_key, public_key_hash, SessionAuthenticator};

use crate::{ClientSession, NodeTree, SessionBuilder, SessionObserver, Transport};

/// Registry-side lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Handshake done, auth token not yet presented
    Connecting,
    Connected,
}

struct Entry {
    session: Arc<ClientSession>,
    state: SessionState,
}

pub struct SessionRegistry {
    authenticator: Arc<SessionAuthenticator>,
    tree: Arc<dyn NodeTree>,
    transport: Arc<dyn Transport>,
    observer: Arc<dyn SessionObserver>,
    require_key_binding: bool,
    next_id: AtomicU64,
    sessions: DashMap<SessionId, Entry>,
}

impl SessionRegistry {
    pub fn new(
        authenticator: Arc<SessionAuthenticator>,
        tree: Arc<dyn NodeTree>,
        transport: Arc<dyn Transport>,
        observer: Arc<dyn SessionObserver>,
    ) -> Self {
        SessionRegistry {
            authenticator,
            tree,
            transport,
            observer,
            require_key_binding: false,
            next_id: AtomicU64::new(0),
            sessions: DashMap::new(),
        }
    }

    /// Require the identifier's hash segment to match the declared key
    pub fn require_key_binding(mut self, enabled: bool) -> Self {
        self.require_key_binding = enabled;
        self
    }

    pub fn authenticator(&self) -> &Arc<SessionAuthenticator> {
        &self.authenticator
    }

    /// Build and record a session for a completed handshake
    pub fn register_new_session(
        &self,
        ds_id: &str,
        payload: &HandshakePayload,
    ) -> BrokerResult<Arc<ClientSession>> {
        let session = self.build_session(ds_id, payload).map_err(|e| {
            tracing::warn!("rejected handshake from {}: {}", ds_id, e);
            e
        })?;

        self.sessions.insert(
            session.id(),
            Entry {
                session: Arc::clone(&session),
                state: SessionState::Connecting,
            },
        );
        tracing::info!("{} connecting as {:?} at {}", session.ds_id(), session.id(), session.path());

        self.observer.session_connecting(&session);
        Ok(session)
    }

    fn build_session(&self, ds_id: &str, payload: &HandshakePayload) -> BrokerResult<Arc<ClientSession>> {
        let ds_id = DsId::parse(ds_id)?;
        payload.validate()?;

        if self.require_key_binding {
            let key = decode_public_key(&payload.public_key)?;
            if public_key_hash(&key) != ds_id.hash_segment() {
                return Err(BrokerError::InvalidIdentifier(format!(
                    "{} is not bound to the declared public key",
                    ds_id
                )));
            }
        }

        // Key agreement first: a bad key must not reserve a tree path
        let temp_key = self.authenticator.generate_ephemeral_key_pair();
        let shared_secret = self
            .authenticator
            .derive_shared_secret(&temp_key, &payload.public_key)?;
        let salt = self.authenticator.generate_salt();
        let path = self.tree.assign_offline_path(&ds_id);

        let id = SessionId::new(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let session = SessionBuilder::new(id, ds_id)
            .handshake(payload)
            .salt(salt)
            .path(path)
            .keys(temp_key, shared_secret)
            .build()?;
        Ok(Arc::new(session))
    }

    /// Accept the peer's auth token and promote the session
    ///
    /// A wrong token disconnects the session.
    pub fn session_connected(&self, session: &Arc<ClientSession>, auth: Option<&str>) -> BrokerResult<()> {
        {
            let mut entry = self
                .sessions
                .get_mut(&session.id())
                .ok_or(BrokerError::SessionNotFound)?;

            if session.validate(&self.authenticator, auth) {
                if entry.state == SessionState::Connected {
                    return Ok(());
                }
                entry.state = SessionState::Connected;
            } else {
                drop(entry);
                tracing::warn!("{} failed authentication", session.ds_id());
                self.session_disconnected(session);
                return Err(BrokerError::AuthenticationFailed);
            }
        }

        self.tree.confirm_path(session);
        tracing::info!("{} connected as {:?}", session.ds_id(), session.id());
        self.observer.session_connected(session);
        Ok(())
    }

    /// Tear a session down; `false` if it was already gone
    pub fn session_disconnected(&self, session: &ClientSession) -> bool {
        let Some((_, entry)) = self.sessions.remove(&session.id()) else {
            return false;
        };

        tracing::info!("{} disconnected ({:?})", entry.session.ds_id(), entry.session.id());
        self.observer.session_disconnected(&entry.session);
        if entry.state == SessionState::Connecting && !self.has_live_session(entry.session.ds_id()) {
            self.tree.release_path(&entry.session);
        }
        entry.session.close();
        self.transport.close(&entry.session);
        true
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<ClientSession>> {
        self.sessions.get(&id).map(|e| Arc::clone(&e.session))
    }

    /// Session that has presented a valid auth token
    pub fn connected(&self, id: SessionId) -> BrokerResult<Arc<ClientSession>> {
        let entry = self.sessions.get(&id).ok_or(BrokerError::SessionNotFound)?;
        match entry.state {
            SessionState::Connected => Ok(Arc::clone(&entry.session)),
            SessionState::Connecting => Err(BrokerError::AuthenticationFailed),
        }
    }

    fn has_live_session(&self, ds_id: &DsId) -> bool {
        self.sessions.iter().any(|e| e.session.ds_id() == ds_id)
    }

    /// Newest live session of a link
    pub fn find_by_ds_id(&self, ds_id: &str) -> Option<Arc<ClientSession>> {
        self.sessions
            .iter()
            .filter(|e| e.session.ds_id().as_str() == ds_id)
            .max_by_key(|e| e.session.id())
            .map(|e| Arc::clone(&e.session))
    }

    pub fn state(&self, id: SessionId) -> Option<SessionState> {
        self.sessions.get(&id).map(|e| e.state)
    }

    pub fn sessions(&self) -> Vec<Arc<ClientSession>> {
        self.sessions.iter().map(|e| Arc::clone(&e.session)).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.sessions.len())
            .field("require_key_binding", &self.require_key_binding)
            .finish_non_exhaustive()
    }
}
