//! Producer links
//!
//! A `ProducerLink` is the broker-side handle of a responder. It outlives
//! individual connections: streams opened against a producer stay attached
//! to the link while the producer reconnects.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;

use linkbus_core::SessionId;

use crate::{ClientSession, SubscriptionStream};

/// Broker-side handle of a responder link
pub struct ProducerLink {
    name: String,
    session: RwLock<Option<Arc<ClientSession>>>,
    disconnected_at: RwLock<Option<DateTime<Utc>>>,
    last_path: RwLock<Option<String>>,
    list_streams: DashMap<String, Arc<dyn SubscriptionStream>>,
}

impl ProducerLink {
    pub fn new(name: impl Into<String>) -> Self {
        ProducerLink {
            name: name.into(),
            session: RwLock::new(None),
            disconnected_at: RwLock::new(None),
            last_path: RwLock::new(None),
            list_streams: DashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Session currently serving this producer
    pub fn session(&self) -> Option<Arc<ClientSession>> {
        self.session.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.session.read().is_some()
    }

    /// Attach a freshly connected session
    pub fn bind(&self, session: Arc<ClientSession>) {
        *self.last_path.write() = Some(session.path().to_string());
        *self.session.write() = Some(session);
    }

    /// Tree path of the most recently bound session
    pub fn last_path(&self) -> Option<String> {
        self.last_path.read().clone()
    }

    /// Detach `session` if it is the one currently bound
    ///
    /// A stale session (already replaced by a reconnect) leaves the link
    /// untouched and `false` is returned.
    pub fn unbind(&self, session: SessionId, at: DateTime<Utc>) -> bool {
        let mut current = self.session.write();
        match current.as_ref() {
            Some(s) if s.id() == session => {
                *current = None;
                *self.disconnected_at.write() = Some(at);
                true
            }
            _ => false,
        }
    }

    /// When the producer last went away
    pub fn disconnected_at(&self) -> Option<DateTime<Utc>> {
        *self.disconnected_at.read()
    }

    /// List stream mirroring `path`, created on first use
    ///
    /// The flag is `true` when the stream was created by this call.
    pub fn list_stream_or_insert_with<F>(
        &self,
        path: &str,
        create: F,
    ) -> (Arc<dyn SubscriptionStream>, bool)
    where
        F: FnOnce() -> Arc<dyn SubscriptionStream>,
    {
        let mut created = false;
        let stream = self
            .list_streams
            .entry(path.to_string())
            .or_insert_with(|| {
                created = true;
                create()
            })
            .value()
            .clone();
        (stream, created)
    }

    pub fn list_stream(&self, path: &str) -> Option<Arc<dyn SubscriptionStream>> {
        self.list_streams.get(path).map(|s| Arc::clone(s.value()))
    }

    pub fn list_streams(&self) -> Vec<Arc<dyn SubscriptionStream>> {
        self.list_streams
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    pub fn stream_count(&self) -> usize {
        self.list_streams.len()
    }

    /// Drop streams for which `remove` returns true; returns how many went
    pub fn remove_streams_where<F>(&self, mut remove: F) -> usize
    where
        F: FnMut(&Arc<dyn SubscriptionStream>) -> bool,
    {
        let before = self.list_streams.len();
        self.list_streams.retain(|_, s| !remove(s));
        before.saturating_sub(self.list_streams.len())
    }
}

impl std::fmt::Debug for ProducerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerLink")
            .field("name", &self.name)
            .field("connected", &self.is_connected())
            .field("streams", &self.stream_count())
            .finish()
    }
}
