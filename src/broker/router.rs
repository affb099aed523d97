//! Message Router
//!
//! Fans a released message out to every matching subscriber connection.
//! Each subscriber gets its own sender-side exchange, started by its own
//! worker; the router only looks up handles and enqueues commands, so no lock
//! is held across the exchanges of different connections.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use super::{BrokerError, ConnectionHandle};
use crate::metrics::Metrics;
use crate::protocol::{Message, QoS};
use crate::session::{ConnectionId, DeliveryError};
use crate::topic::SubscriptionLookup;
use crate::transport::DeliverySink;

/// A sender-side exchange the router asked a subscriber worker to start
#[derive(Debug)]
pub struct PendingExchange {
    pub connection: ConnectionId,
    /// Effective QoS after downgrade
    pub qos: QoS,
    /// Allocated identifier (`None` for QoS 0) or the allocation error
    pub packet_id: oneshot::Receiver<Result<Option<u16>, DeliveryError>>,
}

/// Message router for distributing messages to subscribers
pub struct Router {
    connections: DashMap<ConnectionId, ConnectionHandle>,
    subscriptions: Arc<dyn SubscriptionLookup>,
    max_qos: QoS,
    metrics: Option<Arc<Metrics>>,
}

impl Router {
    pub fn new(subscriptions: Arc<dyn SubscriptionLookup>, max_qos: QoS) -> Self {
        Self {
            connections: DashMap::new(),
            subscriptions,
            max_qos,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Make a connection reachable by routed messages
    pub fn register(&self, handle: ConnectionHandle) {
        self.connections.insert(handle.id().clone(), handle);
    }

    /// Remove `handle`, unless its client id has since been taken by a
    /// newer connection
    pub fn deregister(&self, handle: &ConnectionHandle) {
        self.connections
            .remove_if(handle.id(), |_, current| current.same_worker(handle));
    }

    pub fn connection(&self, id: &str) -> Option<ConnectionHandle> {
        self.connections.get(id).map(|h| h.clone())
    }

    /// Snapshot of every registered handle
    pub fn handles(&self) -> Vec<ConnectionHandle> {
        self.connections.iter().map(|h| h.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Route `message` to its subscribers.
    ///
    /// Returns one entry per subscriber worker that accepted the message.
    /// Subscribers that are offline or whose inbox is full or closed are
    /// skipped without affecting the others.
    pub fn publish(&self, message: &Message) -> Vec<PendingExchange> {
        let subscribers = self.subscriptions.match_subscribers(&message.topic);
        let mut pending = Vec::with_capacity(subscribers.len());

        for subscriber in subscribers {
            let qos = message.qos.min(subscriber.qos).min(self.max_qos);

            // Clone the handle so no map guard is held while enqueueing
            let Some(handle) = self.connection(&subscriber.connection) else {
                trace!(
                    "Subscriber {} offline, skipping {}",
                    subscriber.connection,
                    message.topic
                );
                self.dropped("offline");
                continue;
            };

            match handle.publish(message.clone(), qos) {
                Ok(packet_id) => pending.push(PendingExchange {
                    connection: subscriber.connection,
                    qos,
                    packet_id,
                }),
                Err(BrokerError::InboxFull(id)) => {
                    warn!("Inbox of {} full, dropping message on {}", id, message.topic);
                    self.dropped("full");
                }
                Err(e) => {
                    debug!("Pruning {}: {}", subscriber.connection, e);
                    self.connections
                        .remove_if(&subscriber.connection, |_, h| h.is_closed());
                    self.dropped("closed");
                }
            }
        }

        pending
    }

    fn dropped(&self, reason: &str) {
        if let Some(ref metrics) = self.metrics {
            metrics.fanout_dropped(reason);
        }
    }
}

impl DeliverySink for Router {
    fn deliver(&self, connection: &ConnectionId, message: Message) {
        let pending = self.publish(&message);
        trace!(
            "Routed message from {} on {} to {} subscribers",
            connection,
            message.topic,
            pending.len()
        );
    }
}
