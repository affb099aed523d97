//! Delivery Simulation
//!
//! A publisher client and a set of subscriber clients exchange messages with
//! a [`Broker`] over lossy in-memory links. Client sides run the same
//! connection worker and session state machine as the broker side, so every
//! retransmission and duplicate path is exercised in both directions.

use std::sync::Arc;
use std::time::Duration;

use ahash::AHashSet;
use tracing::{debug, info, warn};

use crate::broker::{
    channel, Broker, BrokerConfig, BrokerError, ConnectOptions, Connection, ConnectionHandle,
};
use crate::config::Config;
use crate::metrics::Metrics;
use crate::protocol::{Message, QoS};
use crate::retry::RetryScheduler;
use crate::session::{ConnectionId, Session};
use crate::transport::{CollectingSink, DropPolicy, LinkTransport};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Consecutive polls with nothing in flight before the run counts as settled
const QUIET_POLLS: usize = 3;

/// Parameters of one simulation run
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub messages: usize,
    pub qos: QoS,
    pub subscribers: usize,
    pub subscriber_qos: QoS,
    /// Every n-th packet on each link is lost (0 = lossless)
    pub drop_every: usize,
    pub topic: String,
    pub timeout: Duration,
    pub broker: BrokerConfig,
}

impl SimulationConfig {
    pub fn from_config(config: &Config) -> Self {
        let sim = &config.simulation;
        Self {
            messages: sim.messages,
            qos: QoS::from_u8(sim.qos).unwrap_or(QoS::ExactlyOnce),
            subscribers: sim.subscribers,
            subscriber_qos: QoS::from_u8(sim.subscriber_qos).unwrap_or(QoS::ExactlyOnce),
            drop_every: sim.drop_every,
            topic: sim.topic.clone(),
            timeout: sim.timeout,
            broker: config.broker_config(),
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// What one subscriber ended up with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberReport {
    pub client_id: ConnectionId,
    /// Deliveries, duplicates included
    pub received: usize,
    /// Distinct payloads delivered
    pub distinct: usize,
}

/// Outcome of a simulation run
#[derive(Debug, Clone)]
pub struct SimulationReport {
    pub published: usize,
    pub qos: QoS,
    pub subscribers: Vec<SubscriberReport>,
    /// Exchanges given up after exhausting their retries, both sides
    pub abandoned: u64,
    /// Publishes refused because no identifier was free
    pub refused: u64,
    pub link_packets_dropped: u64,
    /// Every subscriber saw every message
    pub completed: bool,
    pub elapsed: Duration,
    /// Prometheus text exposition of the run's metrics
    pub metrics: String,
}

impl std::fmt::Display for SimulationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "published {} messages at QoS {} in {:?}",
            self.published, self.qos, self.elapsed
        )?;
        for sub in &self.subscribers {
            writeln!(
                f,
                "  {}: received {} ({} distinct)",
                sub.client_id, sub.received, sub.distinct
            )?;
        }
        writeln!(f, "abandoned exchanges: {}", self.abandoned)?;
        writeln!(f, "refused publishes: {}", self.refused)?;
        writeln!(f, "link packets dropped: {}", self.link_packets_dropped)?;
        write!(f, "completed: {}", self.completed)
    }
}

#[derive(Debug)]
pub enum SimulationError {
    Broker(BrokerError),
    Metrics(prometheus::Error),
}

impl std::fmt::Display for SimulationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SimulationError::Broker(e) => write!(f, "broker error: {}", e),
            SimulationError::Metrics(e) => write!(f, "metrics error: {}", e),
        }
    }
}

impl std::error::Error for SimulationError {}

impl From<BrokerError> for SimulationError {
    fn from(e: BrokerError) -> Self {
        SimulationError::Broker(e)
    }
}

impl From<prometheus::Error> for SimulationError {
    fn from(e: prometheus::Error) -> Self {
        SimulationError::Metrics(e)
    }
}

/// Client sides of the run, sharing one scheduler and one sink
struct Clients<'a> {
    broker: &'a Broker,
    config: &'a SimulationConfig,
    scheduler: RetryScheduler,
    sink: Arc<CollectingSink>,
    metrics: Arc<Metrics>,
}

impl Clients<'_> {
    /// Connect `client_id` to the broker through a pair of links and start
    /// its client-side worker
    fn attach(&self, client_id: &str) -> Result<ConnectionHandle, BrokerError> {
        let id: ConnectionId = Arc::from(client_id);
        let broker_config = &self.config.broker;
        let version = broker_config.protocol_version;
        let policy = DropPolicy::every(self.config.drop_every);

        let (client, inbox) = channel(id.clone(), broker_config.inbox_capacity, &self.scheduler);
        let to_client = LinkTransport::new(client.clone(), version, policy)
            .with_metrics(self.metrics.clone());
        let server = self.broker.connect(
            id.clone(),
            ConnectOptions {
                protocol_version: version,
                clean_session: true,
            },
            Arc::new(to_client),
        )?;
        let to_broker =
            LinkTransport::new(server, version, policy).with_metrics(self.metrics.clone());

        let session = Session::new(id, version, broker_config.retry.clone())
            .with_dedup_retention(broker_config.dedup_retention);
        let worker = Connection::new(
            session,
            inbox,
            Arc::new(to_broker),
            self.sink.clone(),
            self.scheduler.clone(),
        )
        .with_metrics(self.metrics.clone());
        tokio::spawn(worker.run());

        Ok(client)
    }
}

/// Run the simulation to completion or until `config.timeout` elapses
pub async fn run(config: SimulationConfig) -> Result<SimulationReport, SimulationError> {
    let started = tokio::time::Instant::now();
    let metrics = Arc::new(Metrics::new());
    let broker = Broker::with_metrics(config.broker.clone(), metrics.clone());
    let (scheduler, _) = RetryScheduler::spawn();
    let sink = CollectingSink::new();

    let clients = Clients {
        broker: &broker,
        config: &config,
        scheduler,
        sink: sink.clone(),
        metrics: metrics.clone(),
    };

    let subscriber_ids: Vec<String> = (1..=config.subscribers)
        .map(|n| format!("db-{}", n))
        .collect();
    let mut handles = Vec::with_capacity(config.subscribers + 1);
    for id in &subscriber_ids {
        handles.push(clients.attach(id)?);
        broker.subscribe(id.as_str(), &config.topic, config.subscriber_qos)?;
    }
    let publisher = clients.attach("plc-1")?;
    handles.push(publisher.clone());

    info!(
        "Publishing {} messages at QoS {} to {} subscribers (drop every {})",
        config.messages, config.qos, config.subscribers, config.drop_every
    );

    let mut replies = Vec::with_capacity(config.messages);
    for n in 0..config.messages {
        let message = Message::new(config.topic.as_str(), n.to_string(), config.qos);
        replies.push(publisher.submit(message, config.qos).await?);
    }
    for reply in replies {
        match reply.await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => debug!("Publisher refused a message: {}", e),
            Err(_) => warn!("Publisher stopped before answering"),
        }
    }

    let completed = wait_for_quiet(&config, &subscriber_ids, &sink, &metrics, started).await;
    if !completed {
        warn!("Simulation ended before every subscriber received every message");
    }

    let subscribers = subscriber_ids
        .iter()
        .map(|id| {
            let messages = sink.messages(id);
            let distinct: AHashSet<_> = messages.iter().map(|m| m.payload.clone()).collect();
            SubscriberReport {
                client_id: Arc::from(id.as_str()),
                received: messages.len(),
                distinct: distinct.len(),
            }
        })
        .collect();

    let report = SimulationReport {
        published: config.messages,
        qos: config.qos,
        subscribers,
        abandoned: metrics.exchanges_abandoned_total.get(),
        refused: metrics.identifiers_exhausted_total.get(),
        link_packets_dropped: metrics.link_packets_dropped.get(),
        completed,
        elapsed: started.elapsed(),
        metrics: metrics.encode_text()?,
    };

    for handle in &handles {
        let _ = handle.disconnect().await;
    }
    broker.shutdown().await;

    Ok(report)
}

/// Poll until every subscriber has every message and nothing is in flight,
/// until nothing has been in flight for a while, or until the timeout
async fn wait_for_quiet(
    config: &SimulationConfig,
    subscriber_ids: &[String],
    sink: &CollectingSink,
    metrics: &Metrics,
    started: tokio::time::Instant,
) -> bool {
    let deadline = started + config.timeout;
    let mut quiet = 0;

    loop {
        let in_flight: i64 = ["outbound", "inbound"]
            .iter()
            .map(|d| metrics.inflight_exchanges.with_label_values(&[*d]).get())
            .sum();
        let complete = subscriber_ids
            .iter()
            .all(|id| sink.count(id) >= config.messages);

        if in_flight == 0 {
            quiet += 1;
        } else {
            quiet = 0;
        }

        if (complete && in_flight == 0) || quiet >= QUIET_POLLS {
            return complete;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!("Simulation timed out with {} exchanges in flight", in_flight);
            return complete;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config() {
        let config = Config::parse(
            r#"
[simulation]
messages = 10
qos = 1
subscribers = 4
subscriber_qos = 0
drop_every = 3
"#,
        )
        .unwrap();

        let sim = SimulationConfig::from_config(&config);
        assert_eq!(sim.messages, 10);
        assert_eq!(sim.qos, QoS::AtLeastOnce);
        assert_eq!(sim.subscriber_qos, QoS::AtMostOnce);
        assert_eq!(sim.subscribers, 4);
        assert_eq!(sim.drop_every, 3);
    }

    #[test]
    fn test_report_display() {
        let report = SimulationReport {
            published: 2,
            qos: QoS::ExactlyOnce,
            subscribers: vec![SubscriberReport {
                client_id: Arc::from("db-1"),
                received: 2,
                distinct: 2,
            }],
            abandoned: 0,
            refused: 0,
            link_packets_dropped: 1,
            completed: true,
            elapsed: Duration::from_millis(5),
            metrics: String::new(),
        };

        let text = report.to_string();
        assert!(text.contains("db-1: received 2 (2 distinct)"));
        assert!(text.ends_with("completed: true"));
    }
}
