//! Prometheus metrics for RelayMQ
//!
//! Counters for the delivery core: packet traffic per type, retransmissions,
//! deliveries, suppressed duplicates, abandoned exchanges and fan-out losses.
//! Rendered in the text exposition format by [`Metrics::encode_text`].

use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};

use crate::protocol::PacketType;
use crate::session::Direction;

/// All RelayMQ metrics in one place
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // Connection metrics
    pub connections_current: IntGauge,
    pub sessions_expired_total: IntCounter,

    // Packet metrics (by type)
    pub packets_received_total: IntCounterVec,
    pub packets_sent_total: IntCounterVec,
    pub retransmissions_total: IntCounterVec,
    pub stray_packets_total: IntCounterVec,

    // Delivery metrics
    pub deliveries_total: IntCounter,
    pub duplicates_suppressed_total: IntCounter,
    pub exchanges_abandoned_total: IntCounter,
    pub identifiers_exhausted_total: IntCounter,
    pub inflight_exchanges: IntGaugeVec,

    // Routing metrics
    pub fanout_dropped_total: IntCounterVec,
    pub link_packets_dropped: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let connections_current = IntGauge::with_opts(Opts::new(
            "relaymq_connections_current",
            "Current number of connection workers",
        ))
        .unwrap();

        let sessions_expired_total = IntCounter::with_opts(Opts::new(
            "relaymq_sessions_expired_total",
            "Parked sessions removed after their expiry",
        ))
        .unwrap();

        let packets_received_total = IntCounterVec::new(
            Opts::new(
                "relaymq_packets_received_total",
                "Packets received from peers by type",
            ),
            &["type"],
        )
        .unwrap();

        let packets_sent_total = IntCounterVec::new(
            Opts::new("relaymq_packets_sent_total", "Packets sent to peers by type"),
            &["type"],
        )
        .unwrap();

        let retransmissions_total = IntCounterVec::new(
            Opts::new(
                "relaymq_retransmissions_total",
                "Packets sent again after a deadline elapsed, by type",
            ),
            &["type"],
        )
        .unwrap();

        let stray_packets_total = IntCounterVec::new(
            Opts::new(
                "relaymq_stray_packets_total",
                "Control packets referencing no live exchange, by type",
            ),
            &["type"],
        )
        .unwrap();

        let deliveries_total = IntCounter::with_opts(Opts::new(
            "relaymq_deliveries_total",
            "Messages handed to a delivery sink",
        ))
        .unwrap();

        let duplicates_suppressed_total = IntCounter::with_opts(Opts::new(
            "relaymq_duplicates_suppressed_total",
            "QoS 2 retransmissions answered without a second delivery",
        ))
        .unwrap();

        let exchanges_abandoned_total = IntCounter::with_opts(Opts::new(
            "relaymq_exchanges_abandoned_total",
            "Exchanges dropped after exhausting their retries",
        ))
        .unwrap();

        let identifiers_exhausted_total = IntCounter::with_opts(Opts::new(
            "relaymq_identifiers_exhausted_total",
            "Publishes refused because no packet identifier was free",
        ))
        .unwrap();

        let inflight_exchanges = IntGaugeVec::new(
            Opts::new(
                "relaymq_inflight_exchanges",
                "Exchanges currently in flight by direction",
            ),
            &["direction"],
        )
        .unwrap();

        let fanout_dropped_total = IntCounterVec::new(
            Opts::new(
                "relaymq_fanout_dropped_total",
                "Routed messages not handed to a subscriber worker, by reason",
            ),
            &["reason"],
        )
        .unwrap();

        let link_packets_dropped = IntCounter::with_opts(Opts::new(
            "relaymq_link_packets_dropped_total",
            "Packets lost on in-memory links by their drop policy",
        ))
        .unwrap();

        // Register all metrics
        registry
            .register(Box::new(connections_current.clone()))
            .unwrap();
        registry
            .register(Box::new(sessions_expired_total.clone()))
            .unwrap();
        registry
            .register(Box::new(packets_received_total.clone()))
            .unwrap();
        registry
            .register(Box::new(packets_sent_total.clone()))
            .unwrap();
        registry
            .register(Box::new(retransmissions_total.clone()))
            .unwrap();
        registry
            .register(Box::new(stray_packets_total.clone()))
            .unwrap();
        registry
            .register(Box::new(deliveries_total.clone()))
            .unwrap();
        registry
            .register(Box::new(duplicates_suppressed_total.clone()))
            .unwrap();
        registry
            .register(Box::new(exchanges_abandoned_total.clone()))
            .unwrap();
        registry
            .register(Box::new(identifiers_exhausted_total.clone()))
            .unwrap();
        registry
            .register(Box::new(inflight_exchanges.clone()))
            .unwrap();
        registry
            .register(Box::new(fanout_dropped_total.clone()))
            .unwrap();
        registry
            .register(Box::new(link_packets_dropped.clone()))
            .unwrap();

        Metrics {
            registry,
            connections_current,
            sessions_expired_total,
            packets_received_total,
            packets_sent_total,
            retransmissions_total,
            stray_packets_total,
            deliveries_total,
            duplicates_suppressed_total,
            exchanges_abandoned_total,
            identifiers_exhausted_total,
            inflight_exchanges,
            fanout_dropped_total,
            link_packets_dropped,
        }
    }

    // Connection helpers

    pub fn connection_opened(&self) {
        self.connections_current.inc();
    }

    pub fn connection_closed(&self) {
        self.connections_current.dec();
    }

    pub fn session_expired(&self) {
        self.sessions_expired_total.inc();
    }

    // Packet helpers

    pub fn packet_received(&self, packet: PacketType) {
        self.packets_received_total
            .with_label_values(&[packet.as_str()])
            .inc();
    }

    pub fn packet_sent(&self, packet: PacketType) {
        self.packets_sent_total
            .with_label_values(&[packet.as_str()])
            .inc();
    }

    pub fn retransmitted(&self, packet: PacketType) {
        self.retransmissions_total
            .with_label_values(&[packet.as_str()])
            .inc();
    }

    pub fn stray_packet(&self, packet: PacketType) {
        self.stray_packets_total
            .with_label_values(&[packet.as_str()])
            .inc();
    }

    // Delivery helpers

    pub fn delivered(&self) {
        self.deliveries_total.inc();
    }

    pub fn duplicate_suppressed(&self) {
        self.duplicates_suppressed_total.inc();
    }

    pub fn exchange_abandoned(&self) {
        self.exchanges_abandoned_total.inc();
    }

    pub fn identifiers_exhausted(&self) {
        self.identifiers_exhausted_total.inc();
    }

    /// Adjust the in-flight gauge by the change observed on one connection
    pub fn add_inflight(&self, direction: Direction, delta: i64) {
        if delta == 0 {
            return;
        }
        let label = match direction {
            Direction::Outbound => "outbound",
            Direction::Inbound => "inbound",
        };
        self.inflight_exchanges.with_label_values(&[label]).add(delta);
    }

    pub fn fanout_dropped(&self, reason: &str) {
        self.fanout_dropped_total.with_label_values(&[reason]).inc();
    }

    /// Render every registered metric in the Prometheus text format
    pub fn encode_text(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
