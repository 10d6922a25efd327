//! Broker facade
//!
//! Ties the handshake, the session registry and stream routing together
//! behind the calls a connection handler makes: handshake, connect with the
//! auth token, hand over inbound frames, disconnect.

use std::sync::Arc;

use linkbus_broker::{ClientSession, SessionRegistry};
use linkbus_core::{
    BrokerError, BrokerResult, HandshakePayload, HandshakeResponse, InboundFrame, RequestMessage,
    SessionId,
};
use linkbus_crypto::SessionAuthenticator;

use crate::{BrokerConfig, ChannelTransport, GcStats, LinkTree, OutboundReceiver, StreamManager};

pub struct Broker {
    config: BrokerConfig,
    tree: Arc<LinkTree>,
    transport: Arc<ChannelTransport>,
    streams: Arc<StreamManager>,
    registry: SessionRegistry,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> BrokerResult<Self> {
        Self::with_authenticator(config, Arc::new(SessionAuthenticator::new()))
    }

    /// Broker using a caller-supplied authenticator (seeded RNG in tests)
    pub fn with_authenticator(
        config: BrokerConfig,
        authenticator: Arc<SessionAuthenticator>,
    ) -> BrokerResult<Self> {
        config.validate()?;

        let tree = Arc::new(LinkTree::new(config.downstream_prefix.clone()));
        let transport = Arc::new(ChannelTransport::new(config.transport_buffer));
        let streams = Arc::new(StreamManager::new(tree.clone(), transport.clone()));
        let registry = SessionRegistry::new(authenticator, tree.clone(), transport.clone(), streams.clone())
            .require_key_binding(config.require_key_binding);

        tracing::info!(
            "broker {} ready, links under {}",
            config.broker_id,
            config.downstream_prefix
        );
        Ok(Broker {
            config,
            tree,
            transport,
            streams,
            registry,
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn tree(&self) -> &LinkTree {
        &self.tree
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn streams(&self) -> &StreamManager {
        &self.streams
    }

    pub fn transport(&self) -> &ChannelTransport {
        &self.transport
    }

    /// Register a link and build the reply carrying `tempKey` and `salt`
    pub fn handshake(
        &self,
        ds_id: &str,
        payload: &HandshakePayload,
    ) -> BrokerResult<(Arc<ClientSession>, HandshakeResponse)> {
        let session = self.registry.register_new_session(ds_id, payload)?;
        let temp_key = session
            .temp_public_key()
            .ok_or(BrokerError::SessionNotFound)?;
        let salt = session.salt().ok_or(BrokerError::SessionNotFound)?;

        let response = HandshakeResponse {
            id: self.config.broker_id.clone(),
            public_key: temp_key.clone(),
            ws_uri: self.config.ws_uri.clone(),
            temp_key,
            salt: salt.as_str().to_string(),
            path: session.path().to_string(),
            version: self.config.protocol_version.clone(),
        };
        Ok((session, response))
    }

    /// [`handshake`](Self::handshake) on a raw JSON body
    pub fn handshake_json(
        &self,
        ds_id: &str,
        body: &str,
    ) -> BrokerResult<(Arc<ClientSession>, HandshakeResponse)> {
        let payload = HandshakePayload::from_json(body).map_err(|e| {
            tracing::warn!("malformed handshake from {}: {}", ds_id, e);
            e
        })?;
        self.handshake(ds_id, &payload)
    }

    /// Open the data channel of a session that presents its auth token
    ///
    /// The returned receiver yields every frame for the connection; it ends
    /// when the session is disconnected.
    pub fn connect(&self, session: SessionId, auth: Option<&str>) -> BrokerResult<OutboundReceiver> {
        let session = self
            .registry
            .get(session)
            .ok_or(BrokerError::SessionNotFound)?;

        // Open first: upstream requests go out while the session is promoted
        let outbound = self.transport.open(session.id());
        self.registry.session_connected(&session, auth)?;
        Ok(outbound)
    }

    /// `false` if the session was already gone
    pub fn disconnect(&self, session: SessionId) -> bool {
        match self.registry.get(session) {
            Some(session) => self.registry.session_disconnected(&session),
            None => false,
        }
    }

    /// Process one inbound JSON frame of a connected session
    ///
    /// Every message of the frame is processed; the first failure is
    /// returned.
    pub fn handle_frame(&self, session: SessionId, frame: &str) -> BrokerResult<()> {
        let session = self.registry.connected(session).map_err(|e| {
            tracing::warn!("frame from unauthenticated session {:?}: {}", session, e);
            e
        })?;
        let frame: InboundFrame = serde_json::from_str(frame)
            .map_err(|e| BrokerError::UnsupportedMessage(e.to_string()))?;

        let mut first_error = None;
        for request in frame.requests {
            if let Err(e) = self.handle_request(&session, request) {
                first_error.get_or_insert(e);
            }
        }
        for response in frame.responses {
            let routed = if session.is_responder() {
                self.streams.route_response(&session, response).map(|_| ())
            } else {
                Err(BrokerError::UnsupportedMessage(format!(
                    "{} sent responses without being a responder",
                    session.ds_id()
                )))
            };
            if let Err(e) = routed {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => {
                tracing::warn!("frame from {}: {}", session.ds_id(), e);
                Err(e)
            }
            None => Ok(()),
        }
    }

    fn handle_request(&self, session: &Arc<ClientSession>, request: RequestMessage) -> BrokerResult<()> {
        if !session.is_requester() {
            return Err(BrokerError::UnsupportedMessage(format!(
                "{} sent requests without being a requester",
                session.ds_id()
            )));
        }

        match request.method.as_deref() {
            Some("list") => {
                let path = request.path.as_deref().ok_or(BrokerError::MissingField("path"))?;
                self.streams.list(session, request.rid, path).map(|_| ())
            }
            Some("close") => {
                self.streams.close_request(session, request.rid);
                Ok(())
            }
            Some(other) => Err(BrokerError::UnsupportedMessage(format!("method {}", other))),
            None => Err(BrokerError::MissingField("method")),
        }
    }

    pub fn collect_garbage(&self) -> GcStats {
        self.streams.collect_garbage()
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("id", &self.config.broker_id)
            .field("sessions", &self.registry.len())
            .finish_non_exhaustive()
    }
}
