//! Simulated links
//!
//! A `SimulatedLink` plays the link side of the protocol against a
//! [`Broker`]: it runs the handshake, proves the shared secret, sends JSON
//! frames and drains what the broker queued for it.

use serde_json::{json, Value};
use tokio::sync::mpsc::error::TryRecvError;

use linkbus_broker::testing::TestLink;
use linkbus_core::{
    BrokerError, BrokerResult, DsId, RequestId, RequestMessage, ResponseMessage, SessionId,
    StreamState, WireMessage,
};
use linkbus_runtime::{Broker, OutboundReceiver};

pub struct SimulatedLink {
    link: TestLink,
    session: Option<SessionId>,
    outbound: Option<OutboundReceiver>,
    path: Option<String>,
    next_rid: u32,
    /// Set when the broker closed the outbound channel
    dropped: bool,
}

impl SimulatedLink {
    fn from_link(link: TestLink) -> Self {
        SimulatedLink {
            link,
            session: None,
            outbound: None,
            path: None,
            next_rid: 0,
            dropped: false,
        }
    }

    pub fn requester(name: &str) -> Self {
        Self::from_link(TestLink::requester(name))
    }

    pub fn responder(name: &str) -> Self {
        Self::from_link(TestLink::responder(name))
    }

    pub fn with_link_data(self, data: Value) -> Self {
        Self::from_link(self.link.with_link_data(data))
    }

    pub fn ds_id(&self) -> DsId {
        self.link.ds_id()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session
    }

    /// Tree path from the last handshake
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Whether the broker ended the outbound channel
    pub fn was_dropped(&self) -> bool {
        self.dropped
    }

    /// Handshake and authenticate
    pub fn connect(&mut self, broker: &Broker) -> BrokerResult<SessionId> {
        let body = serde_json::to_string(&self.link.payload())
            .map_err(|e| BrokerError::UnsupportedMessage(e.to_string()))?;
        let (session, reply) = broker.handshake_json(self.link.ds_id().as_str(), &body)?;

        let token = self.link.auth_token_for(&reply.temp_key, &reply.salt);
        let outbound = broker.connect(session.id(), Some(&token))?;

        self.session = Some(session.id());
        self.outbound = Some(outbound);
        self.path = Some(reply.path);
        self.dropped = false;
        Ok(session.id())
    }

    pub fn disconnect(&mut self, broker: &Broker) -> bool {
        self.outbound = None;
        match self.session.take() {
            Some(id) => broker.disconnect(id),
            None => false,
        }
    }

    /// Send one JSON frame
    pub fn send(&self, broker: &Broker, frame: Value) -> BrokerResult<()> {
        let session = self.session.ok_or(BrokerError::SessionNotFound)?;
        broker.handle_frame(session, &frame.to_string())
    }

    fn allocate_rid(&mut self) -> RequestId {
        self.next_rid += 1;
        RequestId(self.next_rid)
    }

    /// Request the listing of a broker path
    pub fn list(&mut self, broker: &Broker, path: &str) -> BrokerResult<RequestId> {
        let rid = self.allocate_rid();
        self.send(
            broker,
            json!({"requests": [{"rid": rid, "method": "list", "path": path}]}),
        )?;
        Ok(rid)
    }

    pub fn close(&self, broker: &Broker, rid: RequestId) -> BrokerResult<()> {
        self.send(broker, json!({"requests": [{"rid": rid, "method": "close"}]}))
    }

    /// Answer an upstream request with an open diff batch
    pub fn respond(&self, broker: &Broker, rid: RequestId, updates: Vec<Value>) -> BrokerResult<()> {
        let response = ResponseMessage::with_updates(updates)
            .stream(StreamState::Open)
            .rid(rid);
        self.send(broker, WireMessage::response(response).to_json())
    }

    /// Frames queued by the broker since the last drain
    pub fn drain(&mut self) -> Vec<WireMessage> {
        let mut frames = Vec::new();
        let Some(outbound) = self.outbound.as_mut() else {
            return frames;
        };
        loop {
            match outbound.try_recv() {
                Ok(frame) => frames.push(frame),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.dropped = true;
                    break;
                }
            }
        }
        frames
    }

    pub fn take_requests(&mut self) -> Vec<RequestMessage> {
        self.drain()
            .into_iter()
            .flat_map(|frame| match frame {
                WireMessage::Requests(requests) => requests,
                WireMessage::Responses(_) => Vec::new(),
            })
            .collect()
    }

    pub fn take_responses(&mut self) -> Vec<ResponseMessage> {
        self.drain()
            .into_iter()
            .flat_map(|frame| match frame {
                WireMessage::Responses(responses) => responses,
                WireMessage::Requests(_) => Vec::new(),
            })
            .collect()
    }
}

impl std::fmt::Debug for SimulatedLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedLink")
            .field("ds_id", &self.link.ds_id())
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linkbus_runtime::BrokerConfig;

    #[test]
    fn test_connect_and_reconnect() {
        let broker = Broker::new(BrokerConfig::default()).unwrap();
        let mut link = SimulatedLink::responder("sensor");

        let first = link.connect(&broker).unwrap();
        assert_eq!(link.path(), Some("/downstream/sensor"));
        assert!(link.disconnect(&broker));
        assert!(!link.disconnect(&broker));

        let second = link.connect(&broker).unwrap();
        assert_ne!(first, second);
        assert_eq!(link.path(), Some("/downstream/sensor"));
    }

    #[test]
    fn test_send_without_session_fails() {
        let broker = Broker::new(BrokerConfig::default()).unwrap();
        let mut link = SimulatedLink::requester("viewer");

        assert_eq!(
            link.list(&broker, "/downstream/x").unwrap_err(),
            BrokerError::SessionNotFound
        );
    }

    #[test]
    fn test_rids_increase() {
        let broker = Broker::new(BrokerConfig::default()).unwrap();
        let mut producer = SimulatedLink::responder("sensor");
        let mut viewer = SimulatedLink::requester("viewer");
        producer.connect(&broker).unwrap();
        viewer.connect(&broker).unwrap();

        assert_eq!(viewer.list(&broker, "/downstream/sensor").unwrap(), RequestId(1));
        assert_eq!(viewer.list(&broker, "/downstream/sensor/a").unwrap(), RequestId(2));
        assert_eq!(producer.take_requests().len(), 2);
    }
}
