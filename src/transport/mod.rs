//! Transport Layer
//!
//! Seams between the delivery core and the outside world. A [`Transport`]
//! writes packets to the peer of a connection; a [`DeliverySink`] receives
//! messages once their handshake has released them. Inbound packets enter a
//! connection through its [`ConnectionHandle`](crate::broker::ConnectionHandle).

mod link;

pub use link::{DropPolicy, LinkTransport};

use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::protocol::{Message, Packet};
use crate::session::ConnectionId;

/// Outbound packet path of a connection. Fire-and-forget: loss is recovered
/// by retransmission, not by the transport.
pub trait Transport: Send + Sync {
    fn send(&self, connection: &ConnectionId, packet: Packet);
}

/// Receives released application messages.
///
/// For QoS 2 this is invoked at most once per exchange.
pub trait DeliverySink: Send + Sync {
    fn deliver(&self, connection: &ConnectionId, message: Message);
}

/// Sink that keeps every delivered message, grouped by receiving connection
#[derive(Default)]
pub struct CollectingSink {
    delivered: Mutex<AHashMap<ConnectionId, Vec<Message>>>,
}

impl CollectingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Messages delivered on `connection`, in delivery order
    pub fn messages(&self, connection: &str) -> Vec<Message> {
        self.delivered
            .lock()
            .get(connection)
            .cloned()
            .unwrap_or_default()
    }

    pub fn count(&self, connection: &str) -> usize {
        self.delivered.lock().get(connection).map_or(0, Vec::len)
    }

    pub fn total(&self) -> usize {
        self.delivered.lock().values().map(Vec::len).sum()
    }
}

impl DeliverySink for CollectingSink {
    fn deliver(&self, connection: &ConnectionId, message: Message) {
        self.delivered
            .lock()
            .entry(connection.clone())
            .or_default()
            .push(message);
    }
}
