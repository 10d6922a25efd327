//! Stream routing
//!
//! The stream manager owns the producer links, opens list streams for
//! requesters, routes producer responses to their streams and follows
//! session lifecycle to rewire streams when producers come and go.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;

use linkbus_broker::{
    ClientSession, ListRequestGenerator, ListSnapshotStream, ProducerLink, SessionObserver,
    StreamContext, SubscriptionStream, Transport,
};
use linkbus_core::{BrokerError, BrokerResult, RequestId, ResponseMessage, StreamState};

use crate::LinkTree;

/// Outcome of a garbage collection pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GcStats {
    pub streams_removed: usize,
    pub producers_removed: usize,
}

pub struct StreamManager {
    tree: Arc<LinkTree>,
    ctx: StreamContext,
    producers: DashMap<String, Arc<ProducerLink>>,
}

impl StreamManager {
    pub fn new(tree: Arc<LinkTree>, transport: Arc<dyn Transport>) -> Self {
        let ctx = StreamContext {
            tree: tree.clone(),
            requests: Arc::new(ListRequestGenerator),
            transport,
        };
        StreamManager {
            tree,
            ctx,
            producers: DashMap::new(),
        }
    }

    /// Producer link for a mounted name, created on first use
    pub fn producer(&self, name: &str) -> Arc<ProducerLink> {
        self.producers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(ProducerLink::new(name)))
            .value()
            .clone()
    }

    pub fn find_producer(&self, name: &str) -> Option<Arc<ProducerLink>> {
        self.producers.get(name).map(|p| Arc::clone(p.value()))
    }

    pub fn producer_count(&self) -> usize {
        self.producers.len()
    }

    /// Subscribe `requester` to the listing of a broker path under `rid`
    pub fn list(
        &self,
        requester: &Arc<ClientSession>,
        rid: RequestId,
        path: &str,
    ) -> BrokerResult<Arc<dyn SubscriptionStream>> {
        let (name, target) = self
            .tree
            .route(path)
            .ok_or_else(|| BrokerError::PathNotFound(path.to_string()))?;
        let producer = self.producer(&name);
        // A closed listing is not reused; the next request starts over
        producer.remove_streams_where(|s| s.target_path() == target && s.status().is_closed());

        let (stream, created) = producer.list_stream_or_insert_with(&target, || {
            let stream: Arc<dyn SubscriptionStream> =
                ListSnapshotStream::new(target.clone(), producer.clone(), self.ctx.clone());
            stream
        });

        if let Some(previous) = requester.requester_streams().insert(rid, stream.clone()) {
            if !Arc::ptr_eq(&previous, &stream) {
                previous.detach(requester);
            }
        }
        stream.attach(requester, rid);

        if created {
            tracing::debug!("opened list stream {} on {}", target, name);
            stream.producer_connected();
        }
        Ok(stream)
    }

    /// Requester no longer wants `rid`; `false` if it was not open
    pub fn close_request(&self, requester: &ClientSession, rid: RequestId) -> bool {
        match requester.requester_streams().remove_stream(rid) {
            Some(stream) => {
                stream.detach(requester);
                true
            }
            None => false,
        }
    }

    /// Hand a producer response to the stream its rid was issued for
    ///
    /// Responses for rids the broker no longer tracks are dropped.
    pub fn route_response(&self, producer: &ClientSession, response: ResponseMessage) -> BrokerResult<bool> {
        let rid = response.rid.ok_or(BrokerError::MissingField("rid"))?;
        let Some(stream) = producer.responder_streams().get(rid) else {
            tracing::debug!("response for unknown rid {} from {}", rid, producer.ds_id());
            return Ok(false);
        };

        let state = response.stream.unwrap_or(StreamState::Open);
        if state.is_closed() {
            producer.responder_streams().remove(rid);
        }
        stream.dispatch(state, response);
        Ok(true)
    }

    /// Drop streams nobody can use anymore and producers without streams
    ///
    /// A stream goes when it is closed, or when it has no subscriber and
    /// its producer is offline.
    pub fn collect_garbage(&self) -> GcStats {
        let mut stats = GcStats::default();

        for producer in self.producers.iter().map(|p| Arc::clone(p.value())).collect::<Vec<_>>() {
            let session = producer.session();
            stats.streams_removed += producer.remove_streams_where(|stream| {
                let dead = stream.status().is_closed()
                    || (stream.is_empty() && session.is_none());
                if dead {
                    if let (Some(session), Some(rid)) = (&session, stream.upstream_rid()) {
                        session.responder_streams().remove(rid);
                    }
                }
                dead
            });
        }

        let before = self.producers.len();
        self.producers
            .retain(|_, p| p.is_connected() || p.stream_count() > 0);
        stats.producers_removed = before.saturating_sub(self.producers.len());

        if stats != GcStats::default() {
            tracing::debug!(
                "gc removed {} streams, {} producers",
                stats.streams_removed,
                stats.producers_removed
            );
        }
        stats
    }
}

impl SessionObserver for StreamManager {
    fn session_connected(&self, session: &Arc<ClientSession>) {
        if !session.is_responder() {
            return;
        }
        let Some(name) = self.tree.link_name(session) else {
            tracing::warn!("{} connected outside the link tree at {}", session.ds_id(), session.path());
            return;
        };

        let producer = self.producer(&name);
        producer.bind(Arc::clone(session));
        for stream in producer.list_streams() {
            stream.producer_connected();
        }
    }

    fn session_disconnected(&self, session: &Arc<ClientSession>) {
        for (_, stream) in session.requester_streams().drain() {
            stream.detach(session);
        }

        if !session.is_responder() {
            return;
        }
        let Some(producer) = self.tree.link_name(session).and_then(|n| self.find_producer(&n)) else {
            return;
        };
        if producer.unbind(session.id(), Utc::now()) {
            for stream in producer.list_streams() {
                stream.producer_disconnected();
            }
        }
    }
}

impl std::fmt::Debug for StreamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamManager")
            .field("producers", &self.producers.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use linkbus_broker::testing::{RecordingTransport, TestLink};
    use linkbus_broker::{NodeTree, SessionRegistry};
    use linkbus_crypto::SessionAuthenticator;

    struct Setup {
        tree: Arc<LinkTree>,
        transport: Arc<RecordingTransport>,
        streams: Arc<StreamManager>,
        registry: SessionRegistry,
    }

    impl Setup {
        fn new() -> Self {
            let tree = Arc::new(LinkTree::new("/downstream"));
            let transport = Arc::new(RecordingTransport::new());
            let streams = Arc::new(StreamManager::new(tree.clone(), transport.clone()));
            let registry = SessionRegistry::new(
                Arc::new(SessionAuthenticator::new()),
                tree.clone(),
                transport.clone(),
                streams.clone(),
            );
            Setup {
                tree,
                transport,
                streams,
                registry,
            }
        }

        fn connect(&self, link: &TestLink) -> Arc<ClientSession> {
            let session = self
                .registry
                .register_new_session(link.ds_id().as_str(), &link.payload())
                .unwrap();
            let token = link.auth_token(&session.temp_public_key().unwrap(), &session.salt().unwrap());
            self.registry.session_connected(&session, Some(&token)).unwrap();
            session
        }
    }

    fn respond(rid: RequestId, updates: serde_json::Value) -> ResponseMessage {
        let updates = updates.as_array().cloned().unwrap_or_default();
        ResponseMessage::with_updates(updates)
            .stream(StreamState::Open)
            .rid(rid)
    }

    #[test]
    fn test_list_shares_one_upstream_request() {
        let s = Setup::new();
        let producer = s.connect(&TestLink::responder("weather"));
        let a = s.connect(&TestLink::requester("a"));
        let b = s.connect(&TestLink::requester("b"));

        let first = s.streams.list(&a, RequestId(1), "/downstream/weather/city").unwrap();
        let second = s.streams.list(&b, RequestId(7), "/downstream/weather/city").unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.target_path(), "/city");
        assert_eq!(first.subscriber_count(), 2);
        let requests = s.transport.requests_to(producer.id());
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].path.as_deref(), Some("/city"));
    }

    #[test]
    fn test_unknown_path_rejected() {
        let s = Setup::new();
        let a = s.connect(&TestLink::requester("a"));

        let err = s.streams.list(&a, RequestId(1), "/downstream/nobody").err();
        assert_eq!(err, Some(BrokerError::PathNotFound("/downstream/nobody".to_string())));
        assert!(a.requester_streams().is_empty());
    }

    #[test]
    fn test_route_response_fans_out() {
        let s = Setup::new();
        let producer = s.connect(&TestLink::responder("weather"));
        let a = s.connect(&TestLink::requester("a"));
        let stream = s.streams.list(&a, RequestId(3), "/downstream/weather").unwrap();
        let upstream = stream.upstream_rid().unwrap();

        let routed = s
            .streams
            .route_response(&producer, respond(upstream, json!([["$is", "node"]])))
            .unwrap();
        assert!(routed);

        let got = s.transport.responses_to(a.id());
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].rid, Some(RequestId(3)));
        assert_eq!(
            got[0].updates.as_ref().unwrap()[0],
            json!(["$base", "/downstream/weather"])
        );

        assert!(!s
            .streams
            .route_response(&producer, respond(RequestId(99), json!([])))
            .unwrap());
        assert_eq!(
            s.streams.route_response(&producer, ResponseMessage::default()),
            Err(BrokerError::MissingField("rid"))
        );
    }

    #[test]
    fn test_producer_reconnect_reissues_list() {
        let s = Setup::new();
        let link = TestLink::responder("weather");
        let first = s.connect(&link);
        let a = s.connect(&TestLink::requester("a"));
        let stream = s.streams.list(&a, RequestId(3), "/downstream/weather").unwrap();

        s.registry.session_disconnected(&first);
        let last = s.transport.responses_to(a.id()).pop().unwrap();
        assert_eq!(last.updates.unwrap()[0][0], json!("$disconnectedTs"));
        assert!(stream.upstream_rid().is_none());

        let second = s.connect(&link);
        assert_eq!(second.path(), "/downstream/weather");
        let requests = s.transport.requests_to(second.id());
        assert_eq!(requests.len(), 1);
        assert_eq!(stream.upstream_rid(), Some(requests[0].rid));
    }

    #[test]
    fn test_requester_disconnect_detaches() {
        let s = Setup::new();
        s.connect(&TestLink::responder("weather"));
        let a = s.connect(&TestLink::requester("a"));
        let stream = s.streams.list(&a, RequestId(3), "/downstream/weather").unwrap();

        s.registry.session_disconnected(&a);
        assert!(stream.is_empty());
    }

    #[test]
    fn test_close_request_detaches() {
        let s = Setup::new();
        s.connect(&TestLink::responder("weather"));
        let a = s.connect(&TestLink::requester("a"));
        let stream = s.streams.list(&a, RequestId(3), "/downstream/weather").unwrap();

        assert!(s.streams.close_request(&a, RequestId(3)));
        assert!(!s.streams.close_request(&a, RequestId(3)));
        assert!(stream.is_empty());
    }

    #[test]
    fn test_rid_reuse_moves_subscription() {
        let s = Setup::new();
        s.connect(&TestLink::responder("weather"));
        let a = s.connect(&TestLink::requester("a"));
        let old = s.streams.list(&a, RequestId(3), "/downstream/weather/x").unwrap();
        let new = s.streams.list(&a, RequestId(3), "/downstream/weather/y").unwrap();

        assert!(old.is_empty());
        assert_eq!(new.subscriber_rid(a.id()), Some(RequestId(3)));
    }

    #[test]
    fn test_closed_response_ends_stream() {
        let s = Setup::new();
        let producer = s.connect(&TestLink::responder("weather"));
        let a = s.connect(&TestLink::requester("a"));
        let stream = s.streams.list(&a, RequestId(3), "/downstream/weather").unwrap();
        let upstream = stream.upstream_rid().unwrap();

        let closed = ResponseMessage::default().stream(StreamState::Closed).rid(upstream);
        s.streams.route_response(&producer, closed).unwrap();

        assert_eq!(stream.status(), StreamState::Closed);
        assert!(!a.requester_streams().contains(RequestId(3)));
        assert!(producer.responder_streams().get(upstream).is_none());

        let reopened = s.streams.list(&a, RequestId(4), "/downstream/weather").unwrap();
        assert!(!Arc::ptr_eq(&stream, &reopened));
        assert_eq!(reopened.status(), StreamState::Open);
        assert_eq!(s.streams.producer("weather").stream_count(), 1);
    }

    #[test]
    fn test_gc_drops_closed_streams() {
        let s = Setup::new();
        let producer = s.connect(&TestLink::responder("weather"));
        let a = s.connect(&TestLink::requester("a"));
        let stream = s.streams.list(&a, RequestId(3), "/downstream/weather").unwrap();
        let upstream = stream.upstream_rid().unwrap();

        let closed = ResponseMessage::default().stream(StreamState::Closed).rid(upstream);
        s.streams.route_response(&producer, closed).unwrap();

        let stats = s.streams.collect_garbage();
        assert_eq!(stats.streams_removed, 1);
        assert_eq!(stats.producers_removed, 0);
        assert!(s.streams.producer("weather").list_stream("/").is_none());
    }

    #[test]
    fn test_gc_keeps_streams_of_live_producers() {
        let s = Setup::new();
        let producer = s.connect(&TestLink::responder("weather"));
        let a = s.connect(&TestLink::requester("a"));
        s.streams.list(&a, RequestId(3), "/downstream/weather").unwrap();
        s.streams.close_request(&a, RequestId(3));

        assert_eq!(s.streams.collect_garbage(), GcStats::default());

        s.registry.session_disconnected(&producer);
        let stats = s.streams.collect_garbage();
        assert_eq!(stats.streams_removed, 1);
        assert_eq!(stats.producers_removed, 1);
        assert_eq!(s.streams.producer_count(), 0);
        assert!(s.tree.contains("weather"));
    }

    #[test]
    fn test_offline_producer_stream_waits() {
        let s = Setup::new();
        let link = TestLink::responder("weather");
        s.tree.assign_offline_path(&link.ds_id());
        let a = s.connect(&TestLink::requester("a"));

        let stream = s.streams.list(&a, RequestId(1), "/downstream/weather").unwrap();
        assert!(stream.upstream_rid().is_none());

        let producer = s.connect(&link);
        assert_eq!(s.transport.requests_to(producer.id()).len(), 1);
        assert!(stream.upstream_rid().is_some());
    }
}
