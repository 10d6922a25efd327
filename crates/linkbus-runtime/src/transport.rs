//! Channel transport
//!
//! Each open connection gets a bounded queue of outbound frames. The
//! connection's writer task drains the receiving half; the broker core only
//! ever pushes without waiting. A connection whose queue overflows is
//! dropped rather than stalling the fan-out.

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use linkbus_broker::{ClientSession, Transport};
use linkbus_core::{SessionId, WireMessage};

/// Outbound frame receiver for one connection
pub type OutboundReceiver = mpsc::Receiver<WireMessage>;

/// Outbound frame sender for one connection
pub type OutboundSender = mpsc::Sender<WireMessage>;

pub struct ChannelTransport {
    buffer: usize,
    senders: DashMap<SessionId, OutboundSender>,
}

impl ChannelTransport {
    pub fn new(buffer: usize) -> Self {
        ChannelTransport {
            buffer: buffer.max(1),
            senders: DashMap::new(),
        }
    }

    /// Open the outbound queue of a connection, replacing any previous one
    pub fn open(&self, session: SessionId) -> OutboundReceiver {
        let (tx, rx) = mpsc::channel(self.buffer);
        self.senders.insert(session, tx);
        rx
    }

    pub fn is_open(&self, session: SessionId) -> bool {
        self.senders.contains_key(&session)
    }

    pub fn open_count(&self) -> usize {
        self.senders.len()
    }
}

impl Transport for ChannelTransport {
    fn send(&self, session: &ClientSession, message: WireMessage) {
        let Some(tx) = self.senders.get(&session.id()).map(|s| s.clone()) else {
            tracing::trace!("dropping frame for {:?}: no open connection", session.id());
            return;
        };

        match tx.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!("outbound queue of {} full, dropping connection", session.ds_id());
                self.senders.remove(&session.id());
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!("writer of {:?} gone", session.id());
                self.senders.remove(&session.id());
            }
        }
    }

    fn close(&self, session: &ClientSession) {
        self.senders.remove(&session.id());
    }
}

impl std::fmt::Debug for ChannelTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelTransport")
            .field("buffer", &self.buffer)
            .field("open", &self.senders.len())
            .finish()
    }
}
