//! Broker Core
//!
//! Ties the delivery pieces together: one [`Connection`] worker per client,
//! the shared [`RetryScheduler`], the [`Router`] that fans released messages
//! out to subscriber workers, and the [`SessionStore`] that keeps persistent
//! sessions across reconnects.

mod connection;
mod router;

pub use connection::{
    channel, Connection, ConnectionCommand, ConnectionHandle, ConnectionInbox, PublishReply,
};
pub use router::{PendingExchange, Router};

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::metrics::Metrics;
use crate::protocol::{Message, ProtocolVersion, QoS};
use crate::retry::{RetryPolicy, RetryScheduler};
use crate::session::{
    ConnectionId, DeliveryError, Session, SessionStore, DEFAULT_DEDUP_RETENTION,
};
use crate::topic::{SubscriptionStore, TopicError};
use crate::transport::Transport;

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Highest QoS the broker delivers at
    pub max_qos: QoS,
    /// Capacity of each connection worker's inbox
    pub inbox_capacity: usize,
    /// Protocol version used when a client does not say otherwise
    pub protocol_version: ProtocolVersion,
    /// Retransmission policy for new sessions
    pub retry: RetryPolicy,
    /// Quiet period after which a released QoS 2 identifier leaves the dedup
    /// tracker
    pub dedup_retention: Duration,
    /// How long a parked persistent session survives
    pub session_expiry: Duration,
    /// Session expiry check interval
    pub session_expiry_check_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_qos: QoS::ExactlyOnce,
            inbox_capacity: 1024,
            protocol_version: ProtocolVersion::V311,
            retry: RetryPolicy::default(),
            dedup_retention: DEFAULT_DEDUP_RETENTION,
            session_expiry: Duration::from_secs(3600),
            session_expiry_check_interval: Duration::from_secs(60),
        }
    }
}

/// Per-connection options, as a CONNECT packet would carry them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    pub protocol_version: ProtocolVersion,
    /// Discard any parked state and drop it again on disconnect
    pub clean_session: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            protocol_version: ProtocolVersion::V311,
            clean_session: true,
        }
    }
}

/// Broker events
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    /// Client connected
    ClientConnected {
        client_id: ConnectionId,
        protocol_version: ProtocolVersion,
        /// A parked session was picked up again
        resumed: bool,
    },
    /// Client disconnected
    ClientDisconnected { client_id: ConnectionId },
    /// An exchange could not be started or was abandoned
    DeliveryFailed {
        client_id: ConnectionId,
        error: DeliveryError,
    },
}

/// Broker errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Another worker is running for this client id
    ClientIdInUse(ConnectionId),
    /// The connection worker has stopped
    InboxClosed(ConnectionId),
    /// The connection worker's inbox has no room
    InboxFull(ConnectionId),
    InvalidTopic(TopicError),
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerError::ClientIdInUse(id) => write!(f, "client id {} already connected", id),
            BrokerError::InboxClosed(id) => write!(f, "connection {} is closed", id),
            BrokerError::InboxFull(id) => write!(f, "inbox of connection {} is full", id),
            BrokerError::InvalidTopic(e) => write!(f, "invalid topic: {}", e),
        }
    }
}

impl std::error::Error for BrokerError {}

impl From<TopicError> for BrokerError {
    fn from(e: TopicError) -> Self {
        BrokerError::InvalidTopic(e)
    }
}

/// The broker.
///
/// Must be created inside a tokio runtime: construction spawns the retry
/// scheduler and the session expiry task.
pub struct Broker {
    config: BrokerConfig,
    sessions: Arc<SessionStore>,
    subscriptions: Arc<SubscriptionStore>,
    router: Arc<Router>,
    scheduler: RetryScheduler,
    /// Client ids with a running worker
    live: Arc<DashSet<ConnectionId>>,
    events: broadcast::Sender<BrokerEvent>,
    metrics: Option<Arc<Metrics>>,
    expiry_task: JoinHandle<()>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        Self::build(config, None)
    }

    pub fn with_metrics(config: BrokerConfig, metrics: Arc<Metrics>) -> Self {
        Self::build(config, Some(metrics))
    }

    fn build(config: BrokerConfig, metrics: Option<Arc<Metrics>>) -> Self {
        let (events, _) = broadcast::channel(1024);
        let (scheduler, _) = RetryScheduler::spawn();
        let sessions = Arc::new(SessionStore::new(config.session_expiry));
        let subscriptions = Arc::new(SubscriptionStore::new());

        let mut router = Router::new(subscriptions.clone(), config.max_qos);
        if let Some(ref metrics) = metrics {
            router = router.with_metrics(metrics.clone());
        }

        let expiry_task = spawn_expiry_task(
            sessions.clone(),
            subscriptions.clone(),
            config.session_expiry_check_interval,
            metrics.clone(),
        );

        Self {
            config,
            sessions,
            subscriptions,
            router: Arc::new(router),
            scheduler,
            live: Arc::new(DashSet::new()),
            events,
            metrics,
            expiry_task,
        }
    }

    /// Start a broker-side worker for `client_id`.
    ///
    /// `transport` carries packets to the client; packets from the client
    /// enter through the returned handle. A persistent session parked under
    /// the same id is resumed and its pending exchanges go out again.
    pub fn connect(
        &self,
        client_id: impl Into<ConnectionId>,
        options: ConnectOptions,
        transport: Arc<dyn Transport>,
    ) -> Result<ConnectionHandle, BrokerError> {
        let client_id: ConnectionId = client_id.into();
        if !self.live.insert(client_id.clone()) {
            return Err(BrokerError::ClientIdInUse(client_id));
        }

        let session = self.take_session(&client_id, options);
        let resumed = session.is_some();
        let session = match session {
            Some(mut session) => {
                session.set_protocol_version(options.protocol_version);
                session.disconnected_at = None;
                session
            }
            None => Session::new(
                client_id.clone(),
                options.protocol_version,
                self.config.retry.clone(),
            )
            .with_clean_session(options.clean_session)
            .with_dedup_retention(self.config.dedup_retention),
        };

        let (handle, inbox) = channel(
            client_id.clone(),
            self.config.inbox_capacity,
            &self.scheduler,
        );
        self.router.register(handle.clone());

        let mut worker = Connection::new(
            session,
            inbox,
            transport,
            self.router.clone(),
            self.scheduler.clone(),
        )
        .with_events(self.events.clone());
        if let Some(ref metrics) = self.metrics {
            worker = worker.with_metrics(metrics.clone());
        }

        info!(
            "Client {} connected (protocol {:?}, resumed={})",
            client_id, options.protocol_version, resumed
        );
        let _ = self.events.send(BrokerEvent::ClientConnected {
            client_id: client_id.clone(),
            protocol_version: options.protocol_version,
            resumed,
        });

        let sessions = self.sessions.clone();
        let subscriptions = self.subscriptions.clone();
        let router = self.router.clone();
        let live = self.live.clone();
        let events = self.events.clone();
        let registered = handle.clone();
        tokio::spawn(async move {
            let session = worker.run().await;
            if session.clean_session() {
                subscriptions.remove_connection(&client_id);
            } else {
                sessions.park(session, connection::now());
            }
            router.deregister(&registered);
            live.remove(&client_id);

            info!("Client {} disconnected", client_id);
            let _ = events.send(BrokerEvent::ClientDisconnected { client_id });
        });

        Ok(handle)
    }

    /// Parked session to continue with, if any. A clean session connect
    /// throws away what was parked along with its subscriptions.
    fn take_session(&self, client_id: &ConnectionId, options: ConnectOptions) -> Option<Session> {
        if options.clean_session {
            if self.sessions.discard(client_id) {
                debug!("Discarded parked session {}", client_id);
                self.subscriptions.remove_connection(client_id);
            }
            return None;
        }

        let parked = self.sessions.contains(client_id);
        let session = self.sessions.resume(client_id, connection::now());
        if parked && session.is_none() {
            self.subscriptions.remove_connection(client_id);
            if let Some(ref metrics) = self.metrics {
                metrics.session_expired();
            }
        }
        session
    }

    /// Subscribe `client_id` to the exact topic `topic`
    pub fn subscribe(
        &self,
        client_id: impl Into<ConnectionId>,
        topic: &str,
        qos: QoS,
    ) -> Result<(), BrokerError> {
        let client_id = client_id.into();
        debug!("{} subscribed to {} at QoS {}", client_id, topic, qos);
        self.subscriptions.subscribe(topic, client_id, qos)?;
        Ok(())
    }

    pub fn unsubscribe(&self, client_id: &str, topic: &str) -> bool {
        self.subscriptions.unsubscribe(topic, client_id)
    }

    /// Route a message originating inside the broker to its subscribers
    pub fn publish(&self, message: &Message) -> Vec<PendingExchange> {
        self.router.publish(message)
    }

    /// Ask every running worker to stop. Persistent sessions are parked as
    /// their workers exit.
    pub async fn shutdown(&self) {
        let handles = self.router.handles();
        info!("Shutting down {} connections", handles.len());
        for handle in handles {
            let _ = handle.disconnect().await;
        }
        self.expiry_task.abort();
    }

    /// Subscribe to broker events
    pub fn subscribe_events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionStore> {
        &self.subscriptions
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn scheduler(&self) -> &RetryScheduler {
        &self.scheduler
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Get connection count
    pub fn connection_count(&self) -> usize {
        self.live.len()
    }

    /// Get parked session count
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.metrics.as_ref()
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.expiry_task.abort();
    }
}

fn spawn_expiry_task(
    sessions: Arc<SessionStore>,
    subscriptions: Arc<SubscriptionStore>,
    interval: Duration,
    metrics: Option<Arc<Metrics>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            for client_id in sessions.cleanup_expired(connection::now()) {
                debug!("Session {} expired", client_id);
                subscriptions.remove_connection(&client_id);
                if let Some(ref metrics) = metrics {
                    metrics.session_expired();
                }
            }
        }
    })
}
