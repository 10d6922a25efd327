//! Cached list stream
//!
//! One upstream `list` request per (producer, path) is shared by every
//! requester of that path. Each diff batch from the producer is folded into
//! a cache and rebroadcast with the requester's own rid, so a late joiner
//! can be brought up to date from the cache alone.
//!
//! Lock order: the cache lock is always taken before the subscriber map.
//! `dispatch` collects its recipients under the cache write lock and sends
//! after releasing it; `attach` registers and sends its snapshot under the
//! cache read lock. A joining requester thus sees either the old cache plus
//! the broadcast, or the new cache and no broadcast, never both.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use chrono::{SecondsFormat, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use linkbus_core::{
    is_root, positional, DiffKind, RequestId, ResponseMessage, SessionId, StreamState,
    WireMessage, BASE_TAG, DISCONNECTED_TS_TAG, IS_TAG,
};

use crate::{
    ClientSession, NodeTree, ProducerLink, RequestGenerator, StreamKind, SubscriptionStream,
    Transport,
};

/// Collaborators shared by every stream of a broker
#[derive(Clone)]
pub struct StreamContext {
    pub tree: Arc<dyn NodeTree>,
    pub requests: Arc<dyn RequestGenerator>,
    pub transport: Arc<dyn Transport>,
}

struct Subscriber {
    session: Arc<ClientSession>,
    rid: RequestId,
}

/// List stream backed by a diff cache
pub struct ListSnapshotStream {
    me: Weak<ListSnapshotStream>,
    path: String,
    producer: Arc<ProducerLink>,
    ctx: StreamContext,
    subscribers: DashMap<SessionId, Subscriber>,
    cache: RwLock<HashMap<String, Value>>,
    upstream_rid: Mutex<Option<RequestId>>,
    closed: AtomicBool,
}

impl ListSnapshotStream {
    pub fn new(path: impl Into<String>, producer: Arc<ProducerLink>, ctx: StreamContext) -> Arc<Self> {
        let path = path.into();
        Arc::new_cyclic(|me| ListSnapshotStream {
            me: me.clone(),
            path,
            producer,
            ctx,
            subscribers: DashMap::new(),
            cache: RwLock::new(HashMap::new()),
            upstream_rid: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn producer(&self) -> &Arc<ProducerLink> {
        &self.producer
    }

    /// Number of cached entries
    pub fn cache_len(&self) -> usize {
        self.cache.read().len()
    }

    fn recipients(&self) -> Vec<(Arc<ClientSession>, RequestId)> {
        self.subscribers
            .iter()
            .map(|e| (Arc::clone(&e.session), e.rid))
            .collect()
    }

    fn broadcast(&self, recipients: Vec<(Arc<ClientSession>, RequestId)>, state: StreamState, response: &ResponseMessage) {
        for (session, rid) in recipients {
            if state.is_closed() {
                session.requester_streams().remove_stream(rid);
            }
            let mut out = response.clone();
            out.rid = Some(rid);
            self.ctx.transport.send(&session, WireMessage::response(out));
        }
    }

    /// Path `$base` points at: the producer's node in the tree
    fn base_path(&self, producer: Option<&ClientSession>) -> String {
        match producer {
            Some(session) => self.ctx.tree.resolve_path(session),
            None => self.producer.last_path().unwrap_or_default(),
        }
    }

    /// Fold one batch into the cache; returns the batch to broadcast
    fn apply_updates(&self, cache: &mut HashMap<String, Value>, updates: Vec<Value>) -> Vec<Value> {
        let producer = self.producer.session();
        let mut prepend = Vec::new();
        let mut append = Vec::new();

        for entry in &updates {
            match DiffKind::of(entry) {
                DiffKind::Removal(name) => {
                    cache.remove(name);
                }
                DiffKind::Positional(tag) => {
                    if tag == IS_TAG {
                        cache.clear();

                        let base = positional(BASE_TAG, self.base_path(producer.as_deref()));
                        cache.insert(BASE_TAG.to_string(), base.clone());
                        prepend.push(base);

                        if is_root(&self.path) {
                            let link_data = producer
                                .as_deref()
                                .and_then(|s| self.ctx.tree.root_link_data_update(s));
                            if let Some(update) = link_data {
                                if let DiffKind::Positional(name) = DiffKind::of(&update) {
                                    cache.insert(name.to_string(), update.clone());
                                }
                                append.push(update);
                            }
                        }
                    }
                    cache.insert(tag.to_string(), entry.clone());
                }
                DiffKind::Unrecognized => {
                    tracing::debug!("forwarding unrecognized list entry on {}", self.path);
                }
            }
        }

        if prepend.is_empty() && append.is_empty() {
            return updates;
        }

        let mut out = Vec::with_capacity(prepend.len() + updates.len() + append.len());
        out.extend(prepend);
        out.extend(updates);
        out.extend(append);
        out
    }
}

/// Snapshot order: `$base`, then `$is`, then the rest by name
fn snapshot_rank(name: &str) -> u8 {
    match name {
        BASE_TAG => 0,
        IS_TAG => 1,
        _ => 2,
    }
}

fn ordered_snapshot(cache: &HashMap<String, Value>) -> Vec<Value> {
    let mut names: Vec<&String> = cache.keys().collect();
    names.sort_by(|a, b| {
        snapshot_rank(a)
            .cmp(&snapshot_rank(b))
            .then_with(|| a.cmp(b))
    });
    names.into_iter().map(|name| cache[name].clone()).collect()
}

impl SubscriptionStream for ListSnapshotStream {
    fn kind(&self) -> StreamKind {
        StreamKind::List
    }

    fn target_path(&self) -> &str {
        &self.path
    }

    fn status(&self) -> StreamState {
        if self.closed.load(Ordering::Acquire) {
            StreamState::Closed
        } else {
            StreamState::Open
        }
    }

    fn attach(&self, session: &Arc<ClientSession>, rid: RequestId) {
        let cache = self.cache.read();

        let subscriber = Subscriber {
            session: Arc::clone(session),
            rid,
        };
        if let Some(previous) = self.subscribers.insert(session.id(), subscriber) {
            // Already synchronized under the previous rid; nothing is resent
            tracing::debug!(
                "{:?} re-attached to {} ({} -> {})",
                session.id(),
                self.path,
                previous.rid,
                rid
            );
            return;
        }

        if cache.is_empty() {
            return;
        }

        let response = ResponseMessage::with_updates(ordered_snapshot(&cache))
            .stream(StreamState::Open)
            .rid(rid);
        self.ctx.transport.send(session, WireMessage::response(response));
    }

    fn detach(&self, session: &ClientSession) {
        self.subscribers.remove(&session.id());
    }

    fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    fn subscriber_rid(&self, session: SessionId) -> Option<RequestId> {
        self.subscribers.get(&session).map(|s| s.rid)
    }

    fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn dispatch(&self, state: StreamState, mut response: ResponseMessage) {
        let recipients = {
            let mut cache = self.cache.write();
            if let Some(updates) = response.updates.take() {
                response.updates = Some(self.apply_updates(&mut cache, updates));
            }
            if state.is_closed() {
                self.closed.store(true, Ordering::Release);
            }
            self.recipients()
        };

        tracing::debug!(
            "list {} dispatch ({}) to {} subscribers",
            self.path,
            state.json_name(),
            recipients.len()
        );
        self.broadcast(recipients, state, &response);
    }

    fn producer_connected(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let Some(session) = self.producer.session() else {
            tracing::debug!("producer {} offline, list of {} deferred", self.producer.name(), self.path);
            return;
        };
        let Some(me) = self.me.upgrade() else {
            return;
        };

        let responder = session.responder_streams();
        let rid = responder.next_rid();
        let previous = self.upstream_rid.lock().replace(rid);
        responder.relocate(previous, rid, me);

        tracing::debug!("list {} upstream to {} as rid {}", self.path, self.producer.name(), rid);
        let request = self.ctx.requests.build_list_request(&self.path, rid);
        self.ctx.transport.send(&session, request);
    }

    fn producer_disconnected(&self) {
        let recipients = {
            let mut cache = self.cache.write();
            cache.clear();
            self.recipients()
        };
        self.upstream_rid.lock().take();

        let at = self.producer.disconnected_at().unwrap_or_else(Utc::now);
        let update = positional(
            DISCONNECTED_TS_TAG,
            at.to_rfc3339_opts(SecondsFormat::Millis, false),
        );
        let response = ResponseMessage::with_updates(vec![update]);
        self.broadcast(recipients, StreamState::Open, &response);
    }

    fn upstream_rid(&self) -> Option<RequestId> {
        *self.upstream_rid.lock()
    }

    fn snapshot(&self) -> Vec<Value> {
        ordered_snapshot(&self.cache.read())
    }
}

impl std::fmt::Debug for ListSnapshotStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListSnapshotStream")
            .field("path", &self.path)
            .field("producer", &self.producer.name())
            .field("subscribers", &self.subscribers.len())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
