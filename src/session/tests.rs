//! Delivery session tests
//!
//! Drives both sides of each handshake through a bare [`Session`] and checks
//! the exact actions it asks its owner to perform.

use std::time::{Duration, Instant};

use bytes::Bytes;
use pretty_assertions::assert_eq;

use super::*;
use crate::protocol::{PubRec, PubRel};

// ============================================================================
// Helpers
// ============================================================================

const INTERVAL: Duration = Duration::from_secs(1);
const RETENTION: Duration = Duration::from_secs(10);

fn session(max_retries: u32) -> Session {
    Session::new(
        "line-1".into(),
        ProtocolVersion::V311,
        RetryPolicy::fixed(INTERVAL, max_retries),
    )
    .with_dedup_retention(RETENTION)
}

fn reading() -> Message {
    Message::new("plant/line1/temp", Bytes::from_static(b"21.5"), QoS::ExactlyOnce)
}

fn incoming(qos: QoS, packet_id: Option<u16>, dup: bool) -> Publish {
    let mut publish = Publish::from_message(&reading(), qos, packet_id);
    publish.dup = dup;
    publish
}

fn sends(actions: &Actions) -> Vec<Packet> {
    actions
        .iter()
        .filter_map(|a| match a {
            Action::Send(p) => Some(p.clone()),
            _ => None,
        })
        .collect()
}

fn deliveries(actions: &Actions) -> usize {
    actions
        .iter()
        .filter(|a| matches!(a, Action::Deliver(_)))
        .count()
}

fn token(session: &Session, direction: Direction, packet_id: u16) -> u64 {
    session
        .exchange(direction, packet_id)
        .map(|e| e.timer_token)
        .unwrap()
}

fn retention_token(actions: &Actions, packet_id: u16) -> Option<u64> {
    actions.iter().find_map(|a| match a {
        Action::ArmTimer {
            key: TimerKey::Retention(id),
            token,
            ..
        } if *id == packet_id => Some(*token),
        _ => None,
    })
}

fn expire(session: &mut Session, direction: Direction, packet_id: u16) -> Actions {
    let t = token(session, direction, packet_id);
    session.on_expired(
        TimerKey::Retransmit(direction, packet_id),
        t,
        Instant::now(),
    )
}

// ============================================================================
// QoS 2
// ============================================================================

#[test]
fn test_qos2_receiver_happy_path() {
    let mut s = session(3);
    let now = Instant::now();

    let actions = s
        .on_publish(incoming(QoS::ExactlyOnce, Some(5), false), now)
        .unwrap();
    assert_eq!(
        actions.to_vec(),
        vec![
            Action::Send(Packet::PubRec(PubRec::new(5))),
            Action::ArmTimer {
                key: TimerKey::Retransmit(Direction::Inbound, 5),
                after: INTERVAL,
                token: 2,
            },
        ]
    );
    assert!(s.packet_ids().inbound.is_active(5));

    let actions = s.on_pubrel(5, now).unwrap();
    assert_eq!(
        actions.to_vec(),
        vec![
            Action::Deliver(reading()),
            Action::Send(Packet::PubComp(PubComp::new(5))),
            Action::CancelTimer {
                key: TimerKey::Retransmit(Direction::Inbound, 5),
            },
            Action::ArmTimer {
                key: TimerKey::Retention(5),
                after: RETENTION,
                token: 3,
            },
        ]
    );
    assert!(!s.packet_ids().inbound.is_active(5));
    assert!(s.dedup().contains(5));
    assert_eq!(s.in_flight(Direction::Inbound), 0);
}

#[test]
fn test_qos2_sender_happy_path() {
    let mut s = session(3);
    let now = Instant::now();

    let (id, actions) = s.publish(&reading(), QoS::ExactlyOnce, now).unwrap();
    let id = id.unwrap();
    match &sends(&actions)[..] {
        [Packet::Publish(p)] => {
            assert!(!p.dup);
            assert_eq!(p.packet_id, Some(id));
        }
        other => panic!("unexpected sends {:?}", other),
    }

    let actions = s.on_pubrec(id, now).unwrap();
    assert_eq!(sends(&actions), vec![Packet::PubRel(PubRel::new(id))]);
    assert!(actions
        .iter()
        .any(|a| matches!(a, Action::ArmTimer { .. })));

    let actions = s.on_pubcomp(id, now).unwrap();
    assert_eq!(
        actions.to_vec(),
        vec![Action::CancelTimer {
            key: TimerKey::Retransmit(Direction::Outbound, id),
        }]
    );
    assert!(!s.packet_ids().outbound.is_active(id));
    assert_eq!(s.in_flight(Direction::Outbound), 0);
}

#[test]
fn test_qos2_lost_completion_delivers_once() {
    let mut s = session(3);
    let now = Instant::now();
    let mut delivered = 0;

    delivered += deliveries(
        &s.on_publish(incoming(QoS::ExactlyOnce, Some(7), false), now)
            .unwrap(),
    );
    // PUBREC lost: the sender retransmits PUBLISH with DUP
    let actions = s
        .on_publish(incoming(QoS::ExactlyOnce, Some(7), true), now)
        .unwrap();
    assert_eq!(sends(&actions), vec![Packet::PubRec(PubRec::new(7))]);
    delivered += deliveries(&actions);

    delivered += deliveries(&s.on_pubrel(7, now).unwrap());

    // PUBCOMP lost: the sender retransmits PUBREL, possibly several times
    for _ in 0..3 {
        let actions = s.on_pubrel(7, now).unwrap();
        assert_eq!(sends(&actions), vec![Packet::PubComp(PubComp::new(7))]);
        delivered += deliveries(&actions);
    }

    // A late duplicate PUBLISH is answered from the dedup record
    let actions = s
        .on_publish(incoming(QoS::ExactlyOnce, Some(7), true), now)
        .unwrap();
    assert_eq!(sends(&actions), vec![Packet::PubComp(PubComp::new(7))]);
    delivered += deliveries(&actions);

    assert_eq!(delivered, 1);
}

#[test]
fn test_qos2_sender_duplicate_pubrec_resends_pubrel() {
    let mut s = session(3);
    let now = Instant::now();
    let (id, _) = s.publish(&reading(), QoS::ExactlyOnce, now).unwrap();
    let id = id.unwrap();

    s.on_pubrec(id, now).unwrap();
    let armed = token(&s, Direction::Outbound, id);
    let actions = s.on_pubrec(id, now).unwrap();
    assert_eq!(actions.to_vec(), vec![Action::Send(Packet::PubRel(PubRel::new(id)))]);
    // Deadline untouched
    assert_eq!(token(&s, Direction::Outbound, id), armed);
}

#[test]
fn test_qos2_sender_retransmits_pubrel_without_dup() {
    let mut s = session(3);
    let now = Instant::now();
    let (id, _) = s.publish(&reading(), QoS::ExactlyOnce, now).unwrap();
    let id = id.unwrap();

    let actions = expire(&mut s, Direction::Outbound, id);
    match &sends(&actions)[..] {
        [Packet::Publish(p)] => assert!(p.dup),
        other => panic!("unexpected sends {:?}", other),
    }
    assert_eq!(s.exchange(Direction::Outbound, id).unwrap().retry_count, 1);

    s.on_pubrec(id, now).unwrap();
    // Progress resets the retry budget
    assert_eq!(s.exchange(Direction::Outbound, id).unwrap().retry_count, 0);

    let actions = expire(&mut s, Direction::Outbound, id);
    assert_eq!(sends(&actions), vec![Packet::PubRel(PubRel::new(id))]);

    s.on_pubcomp(id, now).unwrap();
    assert_eq!(s.in_flight(Direction::Outbound), 0);
}

#[test]
fn test_qos2_receiver_retransmits_pubrec() {
    let mut s = session(3);
    s.on_publish(incoming(QoS::ExactlyOnce, Some(11), false), Instant::now())
        .unwrap();

    let actions = expire(&mut s, Direction::Inbound, 11);
    assert_eq!(sends(&actions), vec![Packet::PubRec(PubRec::new(11))]);
    assert_eq!(deliveries(&actions), 0);
}

#[test]
fn test_retention_expiry_purges_dedup_record() {
    let mut s = session(3);
    let now = Instant::now();
    s.on_publish(incoming(QoS::ExactlyOnce, Some(7), false), now)
        .unwrap();
    let actions = s.on_pubrel(7, now).unwrap();
    let retention = retention_token(&actions, 7).unwrap();

    // A stale token leaves the record alone
    s.on_expired(TimerKey::Retention(7), retention + 100, now);
    assert!(s.dedup().contains(7));

    s.on_expired(TimerKey::Retention(7), retention, now);
    assert!(s.dedup().is_empty());

    // The identifier now starts a brand-new exchange
    let actions = s
        .on_publish(incoming(QoS::ExactlyOnce, Some(7), false), now)
        .unwrap();
    assert_eq!(sends(&actions), vec![Packet::PubRec(PubRec::new(7))]);
    assert_eq!(deliveries(&s.on_pubrel(7, now).unwrap()), 1);
}

#[test]
fn test_peer_retransmissions_keep_dedup_record_alive() {
    let mut s = session(3);
    let start = Instant::now();
    s.on_publish(incoming(QoS::ExactlyOnce, Some(7), false), start)
        .unwrap();
    let released = s.on_pubrel(7, start).unwrap();
    let first = retention_token(&released, 7).unwrap();

    // PUBCOMP lost; the PUBREL retransmission restarts the quiet period
    let actions = s.on_pubrel(7, start + Duration::from_secs(9)).unwrap();
    assert_eq!(sends(&actions), vec![Packet::PubComp(PubComp::new(7))]);
    let rearmed = retention_token(&actions, 7).unwrap();
    assert_ne!(rearmed, first);
    assert_eq!(s.dedup().get(7).map(|r| r.retention_token), Some(rearmed));

    // The deadline armed at release is now stale
    s.on_expired(
        TimerKey::Retention(7),
        first,
        start + Duration::from_secs(10),
    );
    assert!(s.dedup().contains(7));

    let actions = s.on_pubrel(7, start + Duration::from_secs(11)).unwrap();
    assert_eq!(sends(&actions), vec![Packet::PubComp(PubComp::new(7))]);
    assert_eq!(deliveries(&actions), 0);

    // A duplicate PUBLISH restarts it as well
    let actions = s
        .on_publish(
            incoming(QoS::ExactlyOnce, Some(7), true),
            start + Duration::from_secs(12),
        )
        .unwrap();
    assert_eq!(sends(&actions), vec![Packet::PubComp(PubComp::new(7))]);
    let latest = retention_token(&actions, 7).unwrap();
    s.on_expired(TimerKey::Retention(7), rearmed, start + Duration::from_secs(19));
    assert!(s.dedup().contains(7));

    // Only silence for a full window purges it
    s.on_expired(TimerKey::Retention(7), latest, start + Duration::from_secs(22));
    assert!(s.dedup().is_empty());
}

#[test]
fn test_new_publish_reusing_released_identifier_is_delivered() {
    let mut s = session(3);
    let now = Instant::now();
    s.on_publish(incoming(QoS::ExactlyOnce, Some(7), false), now)
        .unwrap();
    let released = s.on_pubrel(7, now).unwrap();
    assert_eq!(deliveries(&released), 1);
    let old_retention = retention_token(&released, 7).unwrap();

    // The peer completed the exchange and reuses the identifier (DUP=0)
    let next = Message::new("plant/line1/temp", Bytes::from_static(b"99.9"), QoS::ExactlyOnce);
    let publish = Publish::from_message(&next, QoS::ExactlyOnce, Some(7));
    let actions = s.on_publish(publish, now).unwrap();
    assert_eq!(sends(&actions), vec![Packet::PubRec(PubRec::new(7))]);
    assert_eq!(deliveries(&actions), 0);
    assert!(!s.dedup().contains(7));
    assert!(s.packet_ids().inbound.is_active(7));

    // The old record's deadline must not touch the new exchange
    s.on_expired(TimerKey::Retention(7), old_retention, now);
    assert_eq!(s.in_flight(Direction::Inbound), 1);

    let actions = s.on_pubrel(7, now).unwrap();
    let delivered: Vec<Message> = actions
        .iter()
        .filter_map(|a| match a {
            Action::Deliver(m) => Some(m.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(delivered, vec![next]);
    assert_eq!(sends(&actions), vec![Packet::PubComp(PubComp::new(7))]);
    assert!(s.dedup().contains(7));
}

// ============================================================================
// QoS 1 and QoS 0
// ============================================================================

#[test]
fn test_qos1_duplicate_is_delivered_again() {
    let mut s = session(3);
    let now = Instant::now();

    let first = s
        .on_publish(incoming(QoS::AtLeastOnce, Some(3), false), now)
        .unwrap();
    assert_eq!(deliveries(&first), 1);
    assert_eq!(sends(&first), vec![Packet::PubAck(PubAck::new(3))]);

    // PUBACK lost, sender retransmits with DUP
    let second = s
        .on_publish(incoming(QoS::AtLeastOnce, Some(3), true), now)
        .unwrap();
    assert_eq!(deliveries(&second), 1);
    assert_eq!(sends(&second), vec![Packet::PubAck(PubAck::new(3))]);

    assert_eq!(s.in_flight(Direction::Inbound), 0);
    assert!(!s.packet_ids().inbound.is_active(3));
}

#[test]
fn test_qos1_sender_completes_on_puback() {
    let mut s = session(3);
    let now = Instant::now();
    let (id, _) = s.publish(&reading(), QoS::AtLeastOnce, now).unwrap();
    let id = id.unwrap();

    let actions = expire(&mut s, Direction::Outbound, id);
    match &sends(&actions)[..] {
        [Packet::Publish(p)] => {
            assert!(p.dup);
            assert_eq!(p.packet_id, Some(id));
        }
        other => panic!("unexpected sends {:?}", other),
    }

    s.on_puback(id, now).unwrap();
    assert_eq!(s.in_flight(Direction::Outbound), 0);
    assert!(!s.packet_ids().outbound.is_active(id));
}

#[test]
fn test_qos0_has_no_exchange() {
    let mut s = session(3);
    let now = Instant::now();

    let (id, actions) = s.publish(&reading(), QoS::AtMostOnce, now).unwrap();
    assert_eq!(id, None);
    assert_eq!(actions.len(), 1);
    assert_eq!(s.packet_ids().outbound.active_count(), 0);

    let actions = s
        .on_publish(incoming(QoS::AtMostOnce, None, false), now)
        .unwrap();
    assert_eq!(deliveries(&actions), 1);
    assert!(sends(&actions).is_empty());
}

// ============================================================================
// Retries and abandonment
// ============================================================================

#[test]
fn test_abandon_after_max_retries() {
    let mut s = session(2);
    let now = Instant::now();

    // Fill identifiers 1..=8 so the exchange under test gets 9
    for _ in 0..8 {
        s.publish(&reading(), QoS::AtLeastOnce, now).unwrap();
    }
    let (id, _) = s.publish(&reading(), QoS::ExactlyOnce, now).unwrap();
    assert_eq!(id, Some(9));

    for attempt in 1..=2 {
        let actions = expire(&mut s, Direction::Outbound, 9);
        assert_eq!(sends(&actions).len(), 1);
        assert_eq!(s.exchange(Direction::Outbound, 9).unwrap().retry_count, attempt);
    }

    let actions = expire(&mut s, Direction::Outbound, 9);
    assert_eq!(
        actions.to_vec(),
        vec![Action::Abandoned(DeliveryError::DeliveryAbandoned {
            packet_id: 9,
            direction: Direction::Outbound,
            retries: 2,
        })]
    );
    assert!(s.exchange(Direction::Outbound, 9).is_none());
    assert!(!s.packet_ids().outbound.is_active(9));

    // Late acknowledgment for the abandoned identifier is stray
    assert_eq!(
        s.on_pubrec(9, now),
        Err(DeliveryError::UnknownExchangeReference {
            packet_id: 9,
            packet: PacketType::PubRec,
        })
    );
}

#[test]
fn test_stale_expiry_is_ignored() {
    let mut s = session(3);
    let now = Instant::now();
    let (id, _) = s.publish(&reading(), QoS::ExactlyOnce, now).unwrap();
    let id = id.unwrap();
    let first = token(&s, Direction::Outbound, id);

    s.on_pubrec(id, now).unwrap();
    assert_ne!(token(&s, Direction::Outbound, id), first);

    let actions = s.on_expired(TimerKey::Retransmit(Direction::Outbound, id), first, now);
    assert!(actions.is_empty());
    assert_eq!(s.exchange(Direction::Outbound, id).unwrap().retry_count, 0);

    // Expiry after completion is equally harmless
    let current = token(&s, Direction::Outbound, id);
    s.on_pubcomp(id, now).unwrap();
    let actions = s.on_expired(TimerKey::Retransmit(Direction::Outbound, id), current, now);
    assert!(actions.is_empty());
}

#[test]
fn test_exponential_backoff_grows_delay() {
    let mut s = Session::new(
        "line-1".into(),
        ProtocolVersion::V5,
        RetryPolicy::exponential(Duration::from_millis(100), Duration::from_millis(300), 5),
    );
    let now = Instant::now();
    s.publish(&reading(), QoS::AtLeastOnce, now).unwrap();

    let delays: Vec<Duration> = (0..3)
        .map(|_| {
            expire(&mut s, Direction::Outbound, 1)
                .iter()
                .find_map(|a| match a {
                    Action::ArmTimer { after, .. } => Some(*after),
                    _ => None,
                })
                .unwrap()
        })
        .collect();
    assert_eq!(
        delays,
        vec![
            Duration::from_millis(200),
            Duration::from_millis(300),
            Duration::from_millis(300),
        ]
    );
}

// ============================================================================
// Stray packets
// ============================================================================

#[test]
fn test_unknown_references_are_rejected() {
    let mut s = session(3);
    let now = Instant::now();

    assert_eq!(
        s.on_puback(42, now),
        Err(DeliveryError::UnknownExchangeReference {
            packet_id: 42,
            packet: PacketType::PubAck,
        })
    );
    // Release for an identifier never seen gets no reply
    assert_eq!(
        s.on_pubrel(42, now),
        Err(DeliveryError::UnknownExchangeReference {
            packet_id: 42,
            packet: PacketType::PubRel,
        })
    );
}

#[test]
fn test_wrong_ack_for_qos_leaves_exchange_untouched() {
    let mut s = session(3);
    let now = Instant::now();
    let (id, _) = s.publish(&reading(), QoS::ExactlyOnce, now).unwrap();
    let id = id.unwrap();

    assert!(s.on_puback(id, now).is_err());
    assert!(s.on_pubcomp(id, now).is_err());
    assert_eq!(
        s.exchange(Direction::Outbound, id).unwrap().handshake,
        Handshake::Qos2Sender(Qos2Sender::AwaitingReceived)
    );
}

#[test]
fn test_replayed_ack_never_advances_twice() {
    let mut s = session(3);
    let now = Instant::now();
    let (id, _) = s.publish(&reading(), QoS::AtLeastOnce, now).unwrap();
    let id = id.unwrap();

    assert!(s.on_puback(id, now).is_ok());
    assert!(s.on_puback(id, now).is_err());

    // The identifier is reused only after a full cursor turn
    let (next, _) = s.publish(&reading(), QoS::AtLeastOnce, now).unwrap();
    assert_ne!(next, Some(id));
}

#[test]
fn test_identifier_exhaustion() {
    let mut s = session(3);
    let now = Instant::now();
    for _ in 0..MAX_PACKET_IDS {
        s.publish(&reading(), QoS::AtLeastOnce, now).unwrap();
    }
    assert_eq!(
        s.publish(&reading(), QoS::AtLeastOnce, now).map(|(id, _)| id),
        Err(DeliveryError::ExhaustedIdentifierSpace {
            direction: Direction::Outbound,
        })
    );

    // QoS 0 needs no identifier and still goes out
    assert!(s.publish(&reading(), QoS::AtMostOnce, now).is_ok());

    s.on_puback(100, now).unwrap();
    let (id, _) = s.publish(&reading(), QoS::AtLeastOnce, now).unwrap();
    assert_eq!(id, Some(100));
}

// ============================================================================
// Resume and session store
// ============================================================================

#[test]
fn test_resume_retransmits_in_publish_order() {
    let mut s = session(3).with_clean_session(false);
    let now = Instant::now();

    let (first, _) = s.publish(&reading(), QoS::AtLeastOnce, now).unwrap();
    let (second, _) = s.publish(&reading(), QoS::ExactlyOnce, now).unwrap();
    s.on_pubrec(second.unwrap(), now).unwrap();
    s.on_publish(incoming(QoS::ExactlyOnce, Some(77), false), now)
        .unwrap();

    let actions = s.resume(now);
    let sent = sends(&actions);
    assert_eq!(sent.len(), 2);
    match &sent[0] {
        Packet::Publish(p) => {
            assert!(p.dup);
            assert_eq!(p.packet_id, first);
        }
        other => panic!("expected PUBLISH, got {:?}", other),
    }
    assert_eq!(sent[1], Packet::PubRel(PubRel::new(second.unwrap())));

    // One fresh deadline per exchange, inbound included
    let armed = actions
        .iter()
        .filter(|a| matches!(a, Action::ArmTimer { .. }))
        .count();
    assert_eq!(armed, 3);
}

#[test]
fn test_session_store_park_and_resume() {
    let store = SessionStore::new(Duration::from_secs(60));
    let now = Instant::now();

    let mut s = session(3).with_clean_session(false);
    s.publish(&reading(), QoS::AtLeastOnce, now).unwrap();
    store.park(s, now);
    assert!(store.contains("line-1"));

    let resumed = store.resume("line-1", now + Duration::from_secs(30)).unwrap();
    assert_eq!(resumed.in_flight(Direction::Outbound), 1);
    assert!(store.is_empty());
}

#[test]
fn test_session_store_expiry() {
    let store = SessionStore::new(Duration::from_secs(60));
    let now = Instant::now();

    store.park(session(3), now);
    assert!(store
        .resume("line-1", now + Duration::from_secs(61))
        .is_none());

    store.park(session(3), now);
    assert!(store.cleanup_expired(now + Duration::from_secs(10)).is_empty());
    let removed = store.cleanup_expired(now + Duration::from_secs(60));
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].as_ref(), "line-1");
    assert!(store.is_empty());
}

#[test]
fn test_session_store_discard() {
    let store = SessionStore::default();
    store.park(session(3), Instant::now());
    assert!(store.discard("line-1"));
    assert!(!store.discard("line-1"));
}
