//! RelayMQ - MQTT QoS delivery core
//!
//! Packet identifier allocation, the QoS 0/1/2 handshakes, retransmission
//! with deduplication, and per-subscriber fan-out, driven by one tokio task
//! per connection and a shared retry scheduler.

pub mod broker;
pub mod codec;
pub mod config;
pub mod metrics;
pub mod protocol;
pub mod retry;
pub mod session;
pub mod simulation;
pub mod topic;
pub mod transport;

pub use broker::{Broker, BrokerConfig, BrokerError, BrokerEvent, ConnectOptions, Router};
pub use config::Config;
pub use metrics::Metrics;
pub use protocol::{Message, ProtocolVersion, QoS};
pub use retry::{RetryPolicy, RetryScheduler};
pub use session::{DeliveryError, Session, SessionStore};
pub use topic::{SubscriptionLookup, SubscriptionStore};
pub use transport::{DeliverySink, Transport};
