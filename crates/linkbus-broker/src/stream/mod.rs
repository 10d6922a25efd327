//! Subscription streams
//!
//! A stream mirrors one producer path for any number of requesters. Every
//! stream kind offers the same capability set; the list stream is the
//! cache-backed kind used for child/attribute listings.

pub mod list;

pub use list::*;

use std::sync::Arc;

use serde_json::Value;

use linkbus_core::{RequestId, ResponseMessage, SessionId, StreamState};

use crate::ClientSession;

/// Kind of a subscription stream
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Child/attribute listing
    List,
}

/// Per-path, per-producer multiplexing channel
pub trait SubscriptionStream: Send + Sync {
    fn kind(&self) -> StreamKind;

    /// Producer-relative path mirrored by this stream
    fn target_path(&self) -> &str;

    /// `Open` until a closing response went through, then `Closed` for good
    fn status(&self) -> StreamState;

    /// Register `session` under `rid`
    fn attach(&self, session: &Arc<ClientSession>, rid: RequestId);

    /// Forget `session`; unknown sessions are ignored
    fn detach(&self, session: &ClientSession);

    /// No subscriber left
    fn is_empty(&self) -> bool;

    /// Rid a session is subscribed under
    fn subscriber_rid(&self, session: SessionId) -> Option<RequestId>;

    fn subscriber_count(&self) -> usize;

    /// Apply a producer response and rebroadcast it
    fn dispatch(&self, state: StreamState, response: ResponseMessage);

    /// Open the upstream request on the producer's current session
    fn producer_connected(&self);

    /// Signal producer loss to every subscriber
    fn producer_disconnected(&self);

    /// Rid of the current upstream request
    fn upstream_rid(&self) -> Option<RequestId>;

    /// Entries a new subscriber would receive right now
    fn snapshot(&self) -> Vec<Value>;
}
