use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::sync::mpsc;
use tokio::time::{advance, timeout};

use super::*;

fn id(name: &str) -> ConnectionId {
    Arc::from(name)
}

async fn settle() {
    // Let the scheduler task drain its command queue
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }
}

#[test]
fn test_fixed_delay_is_constant() {
    let policy = RetryPolicy::fixed(Duration::from_secs(2), 3);
    assert_eq!(policy.delay(0), Duration::from_secs(2));
    assert_eq!(policy.delay(7), Duration::from_secs(2));
}

#[test]
fn test_exponential_delay_is_capped() {
    let policy =
        RetryPolicy::exponential(Duration::from_millis(100), Duration::from_millis(700), 10);
    assert_eq!(policy.delay(0), Duration::from_millis(100));
    assert_eq!(policy.delay(1), Duration::from_millis(200));
    assert_eq!(policy.delay(2), Duration::from_millis(400));
    assert_eq!(policy.delay(3), Duration::from_millis(700));
    assert_eq!(policy.delay(u32::MAX), Duration::from_millis(700));
}

#[tokio::test(start_paused = true)]
async fn test_expiry_is_delivered_with_token() {
    let (scheduler, _task) = RetryScheduler::spawn();
    let (tx, mut rx) = mpsc::unbounded_channel();
    scheduler.register(id("plc-1"), tx);

    let key = TimerKey::Retransmit(Direction::Outbound, 5);
    scheduler.arm(id("plc-1"), key, Duration::from_secs(1), 42);
    settle().await;

    advance(Duration::from_millis(999)).await;
    settle().await;
    assert!(rx.try_recv().is_err());

    advance(Duration::from_millis(2)).await;
    let expired = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
    assert_eq!(expired, Some(Expired { key, token: 42 }));
}

#[tokio::test(start_paused = true)]
async fn test_rearm_replaces_previous_deadline() {
    let (scheduler, _task) = RetryScheduler::spawn();
    let (tx, mut rx) = mpsc::unbounded_channel();
    scheduler.register(id("plc-1"), tx);

    let key = TimerKey::Retransmit(Direction::Outbound, 9);
    scheduler.arm(id("plc-1"), key, Duration::from_secs(1), 1);
    scheduler.arm(id("plc-1"), key, Duration::from_secs(3), 2);
    settle().await;

    advance(Duration::from_secs(2)).await;
    settle().await;
    assert!(rx.try_recv().is_err());

    advance(Duration::from_secs(2)).await;
    settle().await;
    assert_eq!(rx.try_recv().ok(), Some(Expired { key, token: 2 }));
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_and_deregister_suppress_expiry() {
    let (scheduler, _task) = RetryScheduler::spawn();
    let (tx_a, mut rx_a) = mpsc::unbounded_channel();
    let (tx_b, mut rx_b) = mpsc::unbounded_channel();
    scheduler.register(id("a"), tx_a);
    scheduler.register(id("b"), tx_b);

    let key = TimerKey::Retention(3);
    scheduler.arm(id("a"), key, Duration::from_secs(1), 1);
    scheduler.arm(id("b"), key, Duration::from_secs(1), 1);
    scheduler.cancel(id("a"), key);
    scheduler.deregister(id("b"));
    settle().await;

    advance(Duration::from_secs(5)).await;
    settle().await;
    assert!(rx_a.try_recv().is_err());
    assert!(rx_b.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_deadlines_fire_in_order_across_connections() {
    let (scheduler, _task) = RetryScheduler::spawn();
    let (tx, mut rx) = mpsc::unbounded_channel();
    scheduler.register(id("a"), tx.clone());
    scheduler.register(id("b"), tx);

    scheduler.arm(id("a"), TimerKey::Retention(1), Duration::from_secs(3), 1);
    scheduler.arm(
        id("b"),
        TimerKey::Retransmit(Direction::Inbound, 2),
        Duration::from_secs(1),
        2,
    );
    settle().await;

    advance(Duration::from_secs(4)).await;
    settle().await;

    let first = rx.try_recv().unwrap();
    let second = rx.try_recv().unwrap();
    assert_eq!(first.token, 2);
    assert_eq!(second.token, 1);
}
