//! Outstanding request tables kept per session
//!
//! A requester addresses its streams by the rids it chose; the broker
//! addresses the streams it opened on a producer by rids it allocated from
//! that producer's counter.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use linkbus_core::RequestId;

use crate::SubscriptionStream;

/// Requester-side table: requester rid → stream
#[derive(Default)]
pub struct RequesterStreams {
    streams: DashMap<RequestId, Arc<dyn SubscriptionStream>>,
}

impl RequesterStreams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stream under a rid, returning the stream it replaced
    pub fn insert(
        &self,
        rid: RequestId,
        stream: Arc<dyn SubscriptionStream>,
    ) -> Option<Arc<dyn SubscriptionStream>> {
        self.streams.insert(rid, stream)
    }

    pub fn get(&self, rid: RequestId) -> Option<Arc<dyn SubscriptionStream>> {
        self.streams.get(&rid).map(|s| Arc::clone(s.value()))
    }

    /// Forget a rid; the session expects no further traffic on it
    pub fn remove_stream(&self, rid: RequestId) -> Option<Arc<dyn SubscriptionStream>> {
        self.streams.remove(&rid).map(|(_, s)| s)
    }

    pub fn contains(&self, rid: RequestId) -> bool {
        self.streams.contains_key(&rid)
    }

    /// Take every entry out of the table
    pub fn drain(&self) -> Vec<(RequestId, Arc<dyn SubscriptionStream>)> {
        let rids: Vec<RequestId> = self.streams.iter().map(|e| *e.key()).collect();
        rids.into_iter()
            .filter_map(|rid| self.streams.remove(&rid))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn clear(&self) {
        self.streams.clear();
    }
}

/// Responder-side table: broker-allocated rid → stream
pub struct ResponderStreams {
    next_rid: AtomicU32,
    streams: DashMap<RequestId, Arc<dyn SubscriptionStream>>,
}

impl ResponderStreams {
    pub fn new() -> Self {
        ResponderStreams {
            next_rid: AtomicU32::new(0),
            streams: DashMap::new(),
        }
    }

    /// Allocate the next upstream rid (starting at 1)
    pub fn next_rid(&self) -> RequestId {
        RequestId(self.next_rid.fetch_add(1, Ordering::Relaxed).wrapping_add(1))
    }

    /// Move a stream to a new rid, dropping its previous registration
    pub fn relocate(
        &self,
        previous: Option<RequestId>,
        rid: RequestId,
        stream: Arc<dyn SubscriptionStream>,
    ) {
        if let Some(previous) = previous {
            self.streams
                .remove_if(&previous, |_, s| Arc::ptr_eq(s, &stream));
        }
        self.streams.insert(rid, stream);
    }

    pub fn get(&self, rid: RequestId) -> Option<Arc<dyn SubscriptionStream>> {
        self.streams.get(&rid).map(|s| Arc::clone(s.value()))
    }

    pub fn remove(&self, rid: RequestId) -> Option<Arc<dyn SubscriptionStream>> {
        self.streams.remove(&rid).map(|(_, s)| s)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn clear(&self) {
        self.streams.clear();
    }
}

impl Default for ResponderStreams {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Fixture, TestLink};

    #[test]
    fn test_rids_are_monotonic() {
        let table = ResponderStreams::new();
        assert_eq!(table.next_rid(), RequestId(1));
        assert_eq!(table.next_rid(), RequestId(2));
        assert_eq!(table.next_rid(), RequestId(3));
    }

    #[test]
    fn test_relocate_moves_stream() {
        let fx = Fixture::new();
        let producer = fx.connect(&TestLink::responder("prod"));
        let stream = fx.list_stream(&producer, "/a");
        let table = ResponderStreams::new();

        table.relocate(None, RequestId(1), stream.clone());
        table.relocate(Some(RequestId(1)), RequestId(2), stream.clone());

        assert!(table.get(RequestId(1)).is_none());
        assert!(table.get(RequestId(2)).is_some());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_requester_drain() {
        let fx = Fixture::new();
        let producer = fx.connect(&TestLink::responder("prod"));
        let table = RequesterStreams::new();
        table.insert(RequestId(4), fx.list_stream(&producer, "/a"));
        table.insert(RequestId(5), fx.list_stream(&producer, "/b"));

        let drained = table.drain();
        assert_eq!(drained.len(), 2);
        assert!(table.is_empty());
        assert!(table.remove_stream(RequestId(4)).is_none());
    }
}
