//! Collaborators the broker core talks to
//!
//! The node tree, request generation and the transport live outside this
//! crate. They are reached through the traits below.

use std::sync::Arc;

use serde_json::Value;

use linkbus_core::{DsId, RequestId, RequestMessage, WireMessage};

use crate::ClientSession;

/// Addressable node tree
pub trait NodeTree: Send + Sync {
    /// Reserve a tree path for a link that is still connecting
    fn assign_offline_path(&self, ds_id: &DsId) -> String;

    /// Mark the path of a session as held by an authenticated link
    fn confirm_path(&self, _session: &ClientSession) {}

    /// Give back a path reserved for a link that never authenticated
    fn release_path(&self, _session: &ClientSession) {}

    /// Current tree path of a session
    fn resolve_path(&self, session: &ClientSession) -> String {
        session.path().to_string()
    }

    /// Link data entry injected into root listings of a producer
    fn root_link_data_update(&self, session: &ClientSession) -> Option<Value>;
}

/// Builds requests sent to producers
pub trait RequestGenerator: Send + Sync {
    fn build_list_request(&self, path: &str, rid: RequestId) -> WireMessage;
}

/// Default generator: `{"requests": [{"rid", "method": "list", "path"}]}`
#[derive(Clone, Copy, Debug, Default)]
pub struct ListRequestGenerator;

impl RequestGenerator for ListRequestGenerator {
    fn build_list_request(&self, path: &str, rid: RequestId) -> WireMessage {
        WireMessage::request(RequestMessage::list(rid, path))
    }
}

/// Outbound side of link connections
///
/// Sends are fire-and-forget hand-offs; delivery failures are the
/// transport's concern.
pub trait Transport: Send + Sync {
    fn send(&self, session: &ClientSession, message: WireMessage);

    fn close(&self, session: &ClientSession);
}

/// Receives session lifecycle transitions from the registry
pub trait SessionObserver: Send + Sync {
    fn session_connecting(&self, _session: &Arc<ClientSession>) {}

    fn session_connected(&self, session: &Arc<ClientSession>);

    fn session_disconnected(&self, session: &Arc<ClientSession>);
}

/// Observer that ignores every transition
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl SessionObserver for NoopObserver {
    fn session_connected(&self, _session: &Arc<ClientSession>) {}

    fn session_disconnected(&self, _session: &Arc<ClientSession>) {}
}
