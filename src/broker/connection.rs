//! Connection Worker
//!
//! One task per connection owns that connection's [`Session`]. Everything
//! else talks to it through its inbox: packets read from the peer, messages
//! routed to it for delivery, and the disconnect request. Expired deadlines
//! arrive on a second channel fed by the shared [`RetryScheduler`].

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, trace, warn};

use super::{BrokerError, BrokerEvent};
use crate::metrics::Metrics;
use crate::protocol::{Message, Packet, PacketType, QoS};
use crate::retry::{Expired, RetryScheduler};
use crate::session::{Action, Actions, ConnectionId, DeliveryError, Direction, Session};
use crate::transport::{DeliverySink, Transport};

/// Resolves to the identifier allocated for a routed message (`None` for
/// QoS 0), or the reason no exchange could be started
pub type PublishReply = oneshot::Sender<Result<Option<u16>, DeliveryError>>;

/// Work item for a connection worker
#[derive(Debug)]
pub enum ConnectionCommand {
    /// Packet received from the peer
    Packet(Packet),
    /// Start delivering a message to the peer
    Publish {
        message: Message,
        qos: QoS,
        reply: Option<PublishReply>,
    },
    /// Stop the worker
    Disconnect,
}

/// Cloneable address of a connection worker
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    commands: mpsc::Sender<ConnectionCommand>,
}

impl ConnectionHandle {
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Hand a packet read from the peer to the worker without waiting
    pub fn packet(&self, packet: Packet) -> Result<(), BrokerError> {
        self.try_send(ConnectionCommand::Packet(packet))
    }

    /// Ask the worker to start delivering `message` at `qos`
    pub fn publish(
        &self,
        message: Message,
        qos: QoS,
    ) -> Result<oneshot::Receiver<Result<Option<u16>, DeliveryError>>, BrokerError> {
        let (tx, rx) = oneshot::channel();
        self.try_send(ConnectionCommand::Publish {
            message,
            qos,
            reply: Some(tx),
        })?;
        Ok(rx)
    }

    /// Like [`publish`](Self::publish), but waits for room in the inbox
    pub async fn submit(
        &self,
        message: Message,
        qos: QoS,
    ) -> Result<oneshot::Receiver<Result<Option<u16>, DeliveryError>>, BrokerError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(ConnectionCommand::Publish {
                message,
                qos,
                reply: Some(tx),
            })
            .await
            .map_err(|_| BrokerError::InboxClosed(self.id.clone()))?;
        Ok(rx)
    }

    /// Stop the worker once it has drained the commands queued before this one
    pub async fn disconnect(&self) -> Result<(), BrokerError> {
        self.commands
            .send(ConnectionCommand::Disconnect)
            .await
            .map_err(|_| BrokerError::InboxClosed(self.id.clone()))
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Whether both handles address the same worker
    pub fn same_worker(&self, other: &ConnectionHandle) -> bool {
        self.commands.same_channel(&other.commands)
    }

    fn try_send(&self, command: ConnectionCommand) -> Result<(), BrokerError> {
        self.commands.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => BrokerError::InboxFull(self.id.clone()),
            mpsc::error::TrySendError::Closed(_) => BrokerError::InboxClosed(self.id.clone()),
        })
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Receiving half of a connection's channels
pub struct ConnectionInbox {
    pub(crate) commands: mpsc::Receiver<ConnectionCommand>,
    pub(crate) timers: mpsc::UnboundedReceiver<Expired>,
}

/// Create the channels of a connection and register it with the scheduler.
///
/// The handle exists before any worker runs, so two workers can be linked to
/// each other before either starts.
pub fn channel(
    id: ConnectionId,
    capacity: usize,
    scheduler: &RetryScheduler,
) -> (ConnectionHandle, ConnectionInbox) {
    let (commands_tx, commands_rx) = mpsc::channel(capacity.max(1));
    let (timers_tx, timers_rx) = mpsc::unbounded_channel();
    scheduler.register(id.clone(), timers_tx);

    (
        ConnectionHandle {
            id,
            commands: commands_tx,
        },
        ConnectionInbox {
            commands: commands_rx,
            timers: timers_rx,
        },
    )
}

/// Current time on the tokio clock, so paused-time tests see a consistent
/// view across sessions and the scheduler
pub(crate) fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Connection worker
pub struct Connection {
    session: Session,
    inbox: ConnectionInbox,
    transport: Arc<dyn Transport>,
    sink: Arc<dyn DeliverySink>,
    scheduler: RetryScheduler,
    events: Option<broadcast::Sender<BrokerEvent>>,
    metrics: Option<Arc<Metrics>>,
    /// In-flight counts last reported to the gauge (outbound, inbound)
    reported_inflight: (i64, i64),
}

impl Connection {
    pub fn new(
        session: Session,
        inbox: ConnectionInbox,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn DeliverySink>,
        scheduler: RetryScheduler,
    ) -> Self {
        Self {
            session,
            inbox,
            transport,
            sink,
            scheduler,
            events: None,
            metrics: None,
            reported_inflight: (0, 0),
        }
    }

    pub fn with_events(mut self, events: broadcast::Sender<BrokerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn client_id(&self) -> &ConnectionId {
        self.session.client_id()
    }

    /// Run until disconnected, then hand the session back to the owner
    pub async fn run(mut self) -> Session {
        if let Some(ref metrics) = self.metrics {
            metrics.connection_opened();
        }

        // Pending exchanges of a resumed session go out again first
        let actions = self.session.resume(now());
        self.apply(actions);

        loop {
            tokio::select! {
                command = self.inbox.commands.recv() => match command {
                    Some(ConnectionCommand::Packet(packet)) => self.handle_packet(packet),
                    Some(ConnectionCommand::Publish { message, qos, reply }) => {
                        self.handle_publish(message, qos, reply)
                    }
                    Some(ConnectionCommand::Disconnect) | None => break,
                },
                Some(expired) = self.inbox.timers.recv() => self.handle_expired(expired),
            }
            self.report_inflight();
        }

        debug!("Connection worker for {} stopping", self.client_id());
        self.scheduler.deregister(self.client_id().clone());
        if let Some(ref metrics) = self.metrics {
            metrics.add_inflight(Direction::Outbound, -self.reported_inflight.0);
            metrics.add_inflight(Direction::Inbound, -self.reported_inflight.1);
            metrics.connection_closed();
        }
        self.session
    }

    fn handle_packet(&mut self, packet: Packet) {
        let packet_type = packet.packet_type();
        if let Some(ref metrics) = self.metrics {
            metrics.packet_received(packet_type);
        }

        match self.session.on_packet(packet, now()) {
            Ok(actions) => {
                if is_suppressed_duplicate(packet_type, &actions) {
                    if let Some(ref metrics) = self.metrics {
                        metrics.duplicate_suppressed();
                    }
                }
                self.apply(actions);
            }
            Err(DeliveryError::UnknownExchangeReference { packet_id, packet }) => {
                debug!(
                    "Ignoring stray {} from {} packet_id={}",
                    packet,
                    self.client_id(),
                    packet_id
                );
                if let Some(ref metrics) = self.metrics {
                    metrics.stray_packet(packet);
                }
            }
            Err(e) => {
                debug!("Rejected {} from {}: {}", packet_type, self.client_id(), e);
            }
        }
    }

    fn handle_publish(&mut self, message: Message, qos: QoS, reply: Option<PublishReply>) {
        let result = match self.session.publish(&message, qos, now()) {
            Ok((packet_id, actions)) => {
                self.apply(actions);
                Ok(packet_id)
            }
            Err(e) => {
                warn!("Cannot deliver to {}: {}", self.client_id(), e);
                if let Some(ref metrics) = self.metrics {
                    metrics.identifiers_exhausted();
                }
                self.emit(BrokerEvent::DeliveryFailed {
                    client_id: self.client_id().clone(),
                    error: e.clone(),
                });
                Err(e)
            }
        };

        if let Some(reply) = reply {
            // The router may have stopped waiting
            let _ = reply.send(result);
        }
    }

    fn handle_expired(&mut self, expired: Expired) {
        let actions = self.session.on_expired(expired.key, expired.token, now());
        if let Some(ref metrics) = self.metrics {
            for action in &actions {
                if let Action::Send(packet) = action {
                    metrics.retransmitted(packet.packet_type());
                }
            }
        }
        self.apply(actions);
    }

    /// Carry out what the session asked for
    fn apply(&mut self, actions: Actions) {
        for action in actions {
            match action {
                Action::Send(packet) => {
                    trace!(
                        "Sending {} to {} packet_id={:?}",
                        packet.packet_type(),
                        self.client_id(),
                        packet.packet_id()
                    );
                    if let Some(ref metrics) = self.metrics {
                        metrics.packet_sent(packet.packet_type());
                    }
                    self.transport.send(self.session.client_id(), packet);
                }
                Action::Deliver(message) => {
                    if let Some(ref metrics) = self.metrics {
                        metrics.delivered();
                    }
                    self.sink.deliver(self.session.client_id(), message);
                }
                Action::ArmTimer { key, after, token } => {
                    self.scheduler
                        .arm(self.session.client_id().clone(), key, after, token);
                }
                Action::CancelTimer { key } => {
                    self.scheduler.cancel(self.session.client_id().clone(), key);
                }
                Action::Abandoned(error) => {
                    if let Some(ref metrics) = self.metrics {
                        metrics.exchange_abandoned();
                    }
                    self.emit(BrokerEvent::DeliveryFailed {
                        client_id: self.session.client_id().clone(),
                        error,
                    });
                }
            }
        }
    }

    fn emit(&self, event: BrokerEvent) {
        if let Some(ref events) = self.events {
            // No receivers is fine
            let _ = events.send(event);
        }
    }

    fn report_inflight(&mut self) {
        let Some(ref metrics) = self.metrics else {
            return;
        };
        let outbound = self.session.in_flight(Direction::Outbound) as i64;
        let inbound = self.session.in_flight(Direction::Inbound) as i64;
        metrics.add_inflight(Direction::Outbound, outbound - self.reported_inflight.0);
        metrics.add_inflight(Direction::Inbound, inbound - self.reported_inflight.1);
        self.reported_inflight = (outbound, inbound);
    }
}

/// A QoS 2 retransmission answered with PUBCOMP and no delivery
fn is_suppressed_duplicate(packet_type: PacketType, actions: &Actions) -> bool {
    matches!(packet_type, PacketType::Publish | PacketType::PubRel)
        && !actions.iter().any(|a| matches!(a, Action::Deliver(_)))
        && actions
            .iter()
            .any(|a| matches!(a, Action::Send(Packet::PubComp(_))))
}
