//! Delivery Session
//!
//! Per-connection delivery state: both packet identifier spaces, the
//! in-flight exchange tables for each direction, and the QoS 2 dedup
//! tracker. A [`Session`] is sans-IO. Every entry point takes the current
//! time and returns the [`Actions`] the owner has to carry out (send a
//! packet, deliver a message, arm or cancel a deadline).
//!
//! Persistent sessions are parked in the [`SessionStore`] on disconnect and
//! resumed, identifiers and exchanges intact, on reconnect.

mod dedup;
mod error;
mod exchange;
mod packet_id;

use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use dashmap::DashMap;
use tracing::{debug, trace, warn};

pub use dedup::{DedupRecord, DedupTracker};
pub use error::{DeliveryError, Result};
pub use exchange::{
    Action, Actions, Handshake, InFlightExchange, Input, Qos1Sender, Qos2Receiver, Qos2Sender,
    Reply, Step, TimerOp,
};
pub use packet_id::{Direction, PacketIdAllocator, PacketIds, MAX_PACKET_IDS};

use crate::protocol::{
    Message, Packet, PacketType, ProtocolVersion, PubAck, PubComp, Publish, QoS,
};
use crate::retry::{RetryPolicy, TimerKey};

/// Connection identity: the MQTT client identifier
pub type ConnectionId = Arc<str>;

/// Default quiet period after which a QoS 2 dedup record is purged
pub const DEFAULT_DEDUP_RETENTION: Duration = Duration::from_secs(10);

/// Client session
pub struct Session {
    /// Client identifier
    client_id: ConnectionId,
    /// Protocol version
    protocol_version: ProtocolVersion,
    /// Clean session flag
    clean_session: bool,
    ids: PacketIds,
    /// Exchanges we started (we sent the PUBLISH)
    outbound: AHashMap<u16, InFlightExchange>,
    /// Exchanges the peer started (QoS 2 only)
    inbound: AHashMap<u16, InFlightExchange>,
    dedup: DedupTracker,
    policy: RetryPolicy,
    retention: Duration,
    next_token: u64,
    /// Disconnect timestamp
    pub disconnected_at: Option<Instant>,
}

impl Session {
    pub fn new(
        client_id: ConnectionId,
        protocol_version: ProtocolVersion,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            client_id,
            protocol_version,
            clean_session: true,
            ids: PacketIds::new(),
            outbound: AHashMap::new(),
            inbound: AHashMap::new(),
            dedup: DedupTracker::new(),
            policy,
            retention: DEFAULT_DEDUP_RETENTION,
            next_token: 0,
            disconnected_at: None,
        }
    }

    pub fn with_clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }

    pub fn with_dedup_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn client_id(&self) -> &ConnectionId {
        &self.client_id
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }

    pub fn set_protocol_version(&mut self, version: ProtocolVersion) {
        self.protocol_version = version;
    }

    pub fn clean_session(&self) -> bool {
        self.clean_session
    }

    pub fn set_clean_session(&mut self, clean_session: bool) {
        self.clean_session = clean_session;
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn packet_ids(&self) -> &PacketIds {
        &self.ids
    }

    pub fn dedup(&self) -> &DedupTracker {
        &self.dedup
    }

    /// Number of live exchanges in one direction
    pub fn in_flight(&self, direction: Direction) -> usize {
        self.table(direction).len()
    }

    pub fn exchange(&self, direction: Direction, packet_id: u16) -> Option<&InFlightExchange> {
        self.table(direction).get(&packet_id)
    }

    /// Start sending `message` to the peer at `qos`.
    ///
    /// Returns the allocated identifier (`None` for QoS 0) and the actions
    /// that put the first PUBLISH on the wire.
    pub fn publish(
        &mut self,
        message: &Message,
        qos: QoS,
        now: Instant,
    ) -> Result<(Option<u16>, Actions)> {
        let mut actions = Actions::new();

        if qos == QoS::AtMostOnce {
            actions.push(Action::Send(Packet::Publish(Publish::from_message(
                message, qos, None,
            ))));
            return Ok((None, actions));
        }

        let packet_id = self.ids.outbound.allocate()?;
        let mut exchange = InFlightExchange::new(
            packet_id,
            qos,
            Direction::Outbound,
            message.clone(),
            now,
        );
        exchange.sequence = self.issue_token();
        exchange.timer_token = self.issue_token();

        trace!(
            "PUBLISH to {} packet_id={} qos={}",
            self.client_id,
            packet_id,
            qos
        );

        actions.push(Action::Send(exchange.packet(Reply::Publish { dup: false })));
        actions.push(Action::ArmTimer {
            key: exchange.timer_key(),
            after: self.policy.delay(0),
            token: exchange.timer_token,
        });
        self.outbound.insert(packet_id, exchange);

        Ok((Some(packet_id), actions))
    }

    /// Feed one packet received from the peer
    pub fn on_packet(&mut self, packet: Packet, now: Instant) -> Result<Actions> {
        match packet {
            Packet::Publish(publish) => self.on_publish(publish, now),
            Packet::PubAck(ack) => self.on_puback(ack.packet_id, now),
            Packet::PubRec(rec) => self.on_pubrec(rec.packet_id, now),
            Packet::PubRel(rel) => self.on_pubrel(rel.packet_id, now),
            Packet::PubComp(comp) => self.on_pubcomp(comp.packet_id, now),
        }
    }

    /// Receiver side of every QoS level
    pub fn on_publish(&mut self, publish: Publish, now: Instant) -> Result<Actions> {
        let mut actions = Actions::new();

        if publish.qos != QoS::ExactlyOnce {
            // QoS 0 and 1 keep no exchange: every copy is delivered
            let mut handshake = Handshake::receiver(publish.qos);
            if let Some(step) = handshake.advance(Input::Publish) {
                trace!(
                    "PUBLISH from {} packet_id={:?} qos={} dup={}",
                    self.client_id,
                    publish.packet_id,
                    publish.qos,
                    publish.dup
                );
                if step.deliver {
                    actions.push(Action::Deliver(publish.to_message()));
                }
                if let (Some(Reply::PubAck), Some(id)) = (step.reply, publish.packet_id) {
                    actions.push(Action::Send(Packet::PubAck(PubAck::new(id))));
                }
            }
            return Ok(actions);
        }

        let packet_id = publish
            .packet_id
            .ok_or(DeliveryError::UnknownExchangeReference {
                packet_id: 0,
                packet: PacketType::Publish,
            })?;

        if self.dedup.contains(packet_id) {
            if publish.dup {
                // Retransmission of a released message: acknowledge again,
                // never deliver again, and keep the record while the peer
                // is still retrying
                debug!(
                    "Duplicate PUBLISH from {} {:?} after release, packet_id={}",
                    self.client_id,
                    self.since_release(packet_id, now),
                    packet_id
                );
                actions.push(Action::Send(Packet::PubComp(PubComp::new(packet_id))));
                actions.push(self.arm_retention(packet_id));
                return Ok(actions);
            }

            // A first transmission reusing a released identifier starts a
            // new exchange
            trace!(
                "PUBLISH from {} reuses released packet_id={}",
                self.client_id,
                packet_id
            );
            self.dedup.purge(packet_id);
        }

        if self.inbound.contains_key(&packet_id) {
            return self.drive(Direction::Inbound, packet_id, PacketType::Publish, now);
        }

        self.ids.inbound.claim(packet_id)?;
        let mut exchange = InFlightExchange::new(
            packet_id,
            QoS::ExactlyOnce,
            Direction::Inbound,
            publish.to_message(),
            now,
        );
        exchange.sequence = self.issue_token();

        trace!(
            "PUBLISH from {} packet_id={} qos=2 dup={}",
            self.client_id,
            packet_id,
            publish.dup
        );

        match exchange.handshake.advance(Input::Publish) {
            Some(mut step) => {
                // The first PUBREC also starts the release deadline
                step.timer = TimerOp::Rearm;
                Ok(self.execute(exchange, step, now))
            }
            None => {
                self.ids.inbound.release(packet_id);
                Err(DeliveryError::UnknownExchangeReference {
                    packet_id,
                    packet: PacketType::Publish,
                })
            }
        }
    }

    pub fn on_puback(&mut self, packet_id: u16, now: Instant) -> Result<Actions> {
        self.drive(Direction::Outbound, packet_id, PacketType::PubAck, now)
    }

    pub fn on_pubrec(&mut self, packet_id: u16, now: Instant) -> Result<Actions> {
        self.drive(Direction::Outbound, packet_id, PacketType::PubRec, now)
    }

    pub fn on_pubcomp(&mut self, packet_id: u16, now: Instant) -> Result<Actions> {
        self.drive(Direction::Outbound, packet_id, PacketType::PubComp, now)
    }

    pub fn on_pubrel(&mut self, packet_id: u16, now: Instant) -> Result<Actions> {
        if !self.inbound.contains_key(&packet_id) && self.dedup.contains(packet_id) {
            // Our PUBCOMP was lost; answer again from the dedup record
            trace!(
                "PUBREL from {} {:?} after release, resending PUBCOMP packet_id={}",
                self.client_id,
                self.since_release(packet_id, now),
                packet_id
            );
            let mut actions = Actions::new();
            actions.push(Action::Send(Packet::PubComp(PubComp::new(packet_id))));
            actions.push(self.arm_retention(packet_id));
            return Ok(actions);
        }

        self.drive(Direction::Inbound, packet_id, PacketType::PubRel, now)
    }

    /// Handle an elapsed deadline. Signals whose token no longer matches
    /// are stale and produce no actions.
    pub fn on_expired(&mut self, key: TimerKey, token: u64, now: Instant) -> Actions {
        match key {
            TimerKey::Retention(packet_id) => {
                let current = self.dedup.get(packet_id).map(|r| r.retention_token);
                if current == Some(token) {
                    self.dedup.purge(packet_id);
                    trace!(
                        "Dedup record for {} packet_id={} purged",
                        self.client_id,
                        packet_id
                    );
                }
                Actions::new()
            }
            TimerKey::Retransmit(direction, packet_id) => {
                let Some(mut exchange) = self.table_mut(direction).remove(&packet_id) else {
                    return Actions::new();
                };

                if exchange.timer_token != token {
                    self.table_mut(direction).insert(packet_id, exchange);
                    return Actions::new();
                }

                if exchange.retry_count >= self.policy.max_retries {
                    return self.abandon(exchange, now);
                }

                let Some(step) = exchange.handshake.advance(Input::Timeout) else {
                    self.table_mut(direction).insert(packet_id, exchange);
                    return Actions::new();
                };

                exchange.retry_count += 1;
                trace!(
                    "Retrying {} exchange with {} packet_id={} attempt={}",
                    direction,
                    self.client_id,
                    packet_id,
                    exchange.retry_count
                );
                self.execute(exchange, step, now)
            }
        }
    }

    /// Restart every pending exchange after a reconnect.
    ///
    /// Outbound exchanges retransmit their last packet in the order they were
    /// started; inbound exchanges and dedup records get fresh deadlines since
    /// the scheduler forgot them when the connection went away.
    pub fn resume(&mut self, now: Instant) -> Actions {
        let mut actions = Actions::new();
        self.disconnected_at = None;

        let mut pending: Vec<(u64, u16)> = self
            .outbound
            .values()
            .map(|e| (e.sequence, e.packet_id))
            .collect();
        pending.sort_unstable();

        for (_, packet_id) in pending {
            let Some(mut exchange) = self.outbound.remove(&packet_id) else {
                continue;
            };
            let mut probe = exchange.handshake;
            match probe.advance(Input::Timeout) {
                Some(step) => {
                    exchange.retry_count = 0;
                    actions.extend(self.execute(exchange, step, now));
                }
                None => {
                    self.outbound.insert(packet_id, exchange);
                }
            }
        }

        let inbound: Vec<u16> = self.inbound.keys().copied().collect();
        for packet_id in inbound {
            let token = self.issue_token();
            if let Some(exchange) = self.inbound.get_mut(&packet_id) {
                exchange.retry_count = 0;
                exchange.timer_token = token;
                actions.push(Action::ArmTimer {
                    key: exchange.timer_key(),
                    after: self.policy.delay(0),
                    token,
                });
            }
        }

        let records: Vec<u16> = self.dedup.packet_ids().collect();
        for packet_id in records {
            actions.push(self.arm_retention(packet_id));
        }

        if !actions.is_empty() {
            debug!(
                "Resumed session {} with {} outbound and {} inbound exchanges",
                self.client_id,
                self.outbound.len(),
                self.inbound.len()
            );
        }
        actions
    }

    /// Look up an exchange, advance it with the received packet, and apply
    /// the step
    fn drive(
        &mut self,
        direction: Direction,
        packet_id: u16,
        packet: PacketType,
        now: Instant,
    ) -> Result<Actions> {
        let input = match packet {
            PacketType::Publish => Input::Publish,
            PacketType::PubAck => Input::PubAck,
            PacketType::PubRec => Input::PubRec,
            PacketType::PubRel => Input::PubRel,
            PacketType::PubComp => Input::PubComp,
        };

        let Some(mut exchange) = self.table_mut(direction).remove(&packet_id) else {
            return Err(DeliveryError::UnknownExchangeReference { packet_id, packet });
        };

        match exchange.handshake.advance(input) {
            Some(step) => Ok(self.execute(exchange, step, now)),
            None => {
                // Wrong packet for this exchange's QoS or state
                self.table_mut(direction).insert(packet_id, exchange);
                Err(DeliveryError::UnknownExchangeReference { packet_id, packet })
            }
        }
    }

    /// Carry out a transition of an exchange that has been taken out of its
    /// table. Non-terminal exchanges are put back.
    fn execute(&mut self, mut exchange: InFlightExchange, step: Step, now: Instant) -> Actions {
        let mut actions = Actions::new();
        let packet_id = exchange.packet_id;
        let direction = exchange.direction;

        if step.progressed {
            exchange.retry_count = 0;
        }

        if step.deliver {
            // Only the QoS 2 receiver keeps an exchange; the tracker is the
            // single gate between release and the sink
            if self.dedup.should_deliver(packet_id, now) {
                actions.push(Action::Deliver(exchange.message.clone()));
            } else {
                debug!(
                    "Suppressed duplicate delivery from {} packet_id={}",
                    self.client_id, packet_id
                );
            }
        }

        if let Some(reply) = step.reply {
            actions.push(Action::Send(exchange.packet(reply)));
            exchange.last_sent = now;
        }

        match step.timer {
            TimerOp::Keep => {}
            TimerOp::Rearm => {
                exchange.timer_token = self.issue_token();
                actions.push(Action::ArmTimer {
                    key: exchange.timer_key(),
                    after: self.policy.delay(exchange.retry_count),
                    token: exchange.timer_token,
                });
            }
            TimerOp::Cancel => actions.push(Action::CancelTimer {
                key: exchange.timer_key(),
            }),
        }

        if step.terminal {
            self.ids.get_mut(direction).release(packet_id);
            trace!(
                "{} exchange with {} complete packet_id={}",
                direction,
                self.client_id,
                packet_id
            );
            if direction == Direction::Inbound && exchange.qos == QoS::ExactlyOnce {
                actions.push(self.arm_retention(packet_id));
            }
        } else {
            self.table_mut(direction).insert(packet_id, exchange);
        }

        actions
    }

    fn abandon(&mut self, exchange: InFlightExchange, now: Instant) -> Actions {
        let mut actions = Actions::new();
        self.ids
            .get_mut(exchange.direction)
            .release(exchange.packet_id);

        warn!(
            "Abandoning {} exchange with {} packet_id={} after {} retries, last sent {:?} ago",
            exchange.direction,
            self.client_id,
            exchange.packet_id,
            exchange.retry_count,
            now.saturating_duration_since(exchange.last_sent)
        );
        actions.push(Action::Abandoned(DeliveryError::DeliveryAbandoned {
            packet_id: exchange.packet_id,
            direction: exchange.direction,
            retries: exchange.retry_count,
        }));
        actions
    }

    fn since_release(&self, packet_id: u16, now: Instant) -> Duration {
        self.dedup
            .get(packet_id)
            .map(|r| now.saturating_duration_since(r.released_at))
            .unwrap_or_default()
    }

    /// (Re)start the quiet period of a dedup record. Any earlier retention
    /// deadline for the identifier becomes stale.
    fn arm_retention(&mut self, packet_id: u16) -> Action {
        let token = self.issue_token();
        self.dedup.set_retention_token(packet_id, token);
        Action::ArmTimer {
            key: TimerKey::Retention(packet_id),
            after: self.retention,
            token,
        }
    }

    fn issue_token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    fn table(&self, direction: Direction) -> &AHashMap<u16, InFlightExchange> {
        match direction {
            Direction::Outbound => &self.outbound,
            Direction::Inbound => &self.inbound,
        }
    }

    fn table_mut(&mut self, direction: Direction) -> &mut AHashMap<u16, InFlightExchange> {
        match direction {
            Direction::Outbound => &mut self.outbound,
            Direction::Inbound => &mut self.inbound,
        }
    }

    /// Check if a parked session has outlived `expiry`
    pub fn is_expired(&self, now: Instant, expiry: Duration) -> bool {
        match self.disconnected_at {
            Some(at) => now.saturating_duration_since(at) >= expiry,
            None => false,
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("client_id", &self.client_id)
            .field("protocol_version", &self.protocol_version)
            .field("clean_session", &self.clean_session)
            .field("outbound", &self.outbound.len())
            .field("inbound", &self.inbound.len())
            .field("dedup", &self.dedup.len())
            .finish()
    }
}

/// Parked persistent sessions, keyed by client identifier.
///
/// A connected session is owned by its connection worker; only disconnected
/// persistent sessions live here.
pub struct SessionStore {
    sessions: DashMap<ConnectionId, Session>,
    expiry: Duration,
}

impl SessionStore {
    pub fn new(expiry: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            expiry,
        }
    }

    /// Keep a disconnected session until it is resumed or expires
    pub fn park(&self, mut session: Session, now: Instant) {
        session.disconnected_at = Some(now);
        debug!(
            "Parking session {} ({} outbound, {} inbound in flight)",
            session.client_id,
            session.outbound.len(),
            session.inbound.len()
        );
        self.sessions.insert(session.client_id.clone(), session);
    }

    /// Take a parked session back, unless it has expired
    pub fn resume(&self, client_id: &str, now: Instant) -> Option<Session> {
        let (_, session) = self.sessions.remove(client_id)?;
        if session.is_expired(now, self.expiry) {
            debug!("Session {} expired before resume", client_id);
            return None;
        }
        Some(session)
    }

    /// Drop a parked session (clean session connect)
    pub fn discard(&self, client_id: &str) -> bool {
        self.sessions.remove(client_id).is_some()
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.sessions.contains_key(client_id)
    }

    /// Clean up expired sessions, returning the client ids that were removed
    pub fn cleanup_expired(&self, now: Instant) -> Vec<ConnectionId> {
        let expiry = self.expiry;
        let mut removed = Vec::new();
        self.sessions.retain(|id, session| {
            let keep = !session.is_expired(now, expiry);
            if !keep {
                removed.push(id.clone());
            }
            keep
        });
        removed
    }

    /// Get session count
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}

#[cfg(test)]
mod tests;
