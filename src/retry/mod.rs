//! Retransmission timing
//!
//! [`RetryPolicy`] decides how long an exchange may wait before its last
//! packet is sent again. [`RetryScheduler`] is a single task that owns every
//! armed deadline in a min-heap and notifies the owning connection when one
//! elapses. The scheduler never touches exchange state; connections receive
//! an [`Expired`] signal and decide for themselves whether it is still
//! relevant by comparing the token.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::time::Duration;

use ahash::AHashMap;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::session::{ConnectionId, Direction};

/// Growth of the retransmission interval across retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// Same interval for every retry
    #[default]
    Fixed,
    /// Interval doubles with every retry, capped at `max_interval`
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub backoff: Backoff,
    pub max_interval: Duration,
    /// Retransmissions allowed before an exchange is abandoned
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn fixed(interval: Duration, max_retries: u32) -> Self {
        Self {
            interval,
            backoff: Backoff::Fixed,
            max_interval: interval,
            max_retries,
        }
    }

    pub fn exponential(interval: Duration, max_interval: Duration, max_retries: u32) -> Self {
        Self {
            interval,
            backoff: Backoff::Exponential,
            max_interval,
            max_retries,
        }
    }

    /// Wait before the deadline following `retry_count` retransmissions
    pub fn delay(&self, retry_count: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.interval,
            Backoff::Exponential => {
                let factor = 1u32 << retry_count.min(16);
                self.interval
                    .saturating_mul(factor)
                    .min(self.max_interval.max(self.interval))
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(5), 5)
    }
}

/// Deadline slot within one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKey {
    /// Retransmission deadline of an in-flight exchange
    Retransmit(Direction, u16),
    /// Purge deadline of a QoS 2 dedup record
    Retention(u16),
}

/// Signal delivered to a connection when one of its deadlines elapses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expired {
    pub key: TimerKey,
    pub token: u64,
}

enum Command {
    Register {
        connection: ConnectionId,
        sender: mpsc::UnboundedSender<Expired>,
    },
    Deregister {
        connection: ConnectionId,
    },
    Arm {
        connection: ConnectionId,
        key: TimerKey,
        deadline: Instant,
        token: u64,
    },
    Cancel {
        connection: ConnectionId,
        key: TimerKey,
    },
}

/// Handle to the scheduler task. Cheap to clone; the task stops once every
/// handle is dropped.
#[derive(Clone)]
pub struct RetryScheduler {
    commands: mpsc::UnboundedSender<Command>,
}

impl RetryScheduler {
    /// Spawn the scheduler task on the current runtime
    pub fn spawn() -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(rx));
        (Self { commands: tx }, task)
    }

    /// Route expiries for `connection` to `sender`. Replaces any previous
    /// registration together with its deadlines.
    pub fn register(&self, connection: ConnectionId, sender: mpsc::UnboundedSender<Expired>) {
        let _ = self.commands.send(Command::Register { connection, sender });
    }

    /// Forget a connection and every deadline it armed
    pub fn deregister(&self, connection: ConnectionId) {
        let _ = self.commands.send(Command::Deregister { connection });
    }

    /// Arm (or re-arm) `key` to fire `after` from now
    pub fn arm(&self, connection: ConnectionId, key: TimerKey, after: Duration, token: u64) {
        let deadline = Instant::now() + after;
        let _ = self.commands.send(Command::Arm {
            connection,
            key,
            deadline,
            token,
        });
    }

    pub fn cancel(&self, connection: ConnectionId, key: TimerKey) {
        let _ = self.commands.send(Command::Cancel { connection, key });
    }
}

struct DeadlineRecord {
    at: Instant,
    generation: u64,
    connection: ConnectionId,
    key: TimerKey,
}

impl PartialEq for DeadlineRecord {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for DeadlineRecord {}

impl PartialOrd for DeadlineRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DeadlineRecord {
    fn cmp(&self, other: &Self) -> Ordering {
        self.at
            .cmp(&other.at)
            .then(self.generation.cmp(&other.generation))
    }
}

struct Armed {
    generation: u64,
    token: u64,
}

#[derive(Default)]
struct SchedulerState {
    heap: BinaryHeap<Reverse<DeadlineRecord>>,
    armed: AHashMap<(ConnectionId, TimerKey), Armed>,
    connections: AHashMap<ConnectionId, mpsc::UnboundedSender<Expired>>,
    generation: u64,
}

impl SchedulerState {
    fn apply(&mut self, command: Command) {
        match command {
            Command::Register { connection, sender } => {
                self.armed.retain(|(c, _), _| *c != connection);
                self.connections.insert(connection, sender);
            }
            Command::Deregister { connection } => {
                self.armed.retain(|(c, _), _| *c != connection);
                self.connections.remove(&connection);
            }
            Command::Arm {
                connection,
                key,
                deadline,
                token,
            } => {
                self.generation += 1;
                let generation = self.generation;
                self.armed
                    .insert((connection.clone(), key), Armed { generation, token });
                self.heap.push(Reverse(DeadlineRecord {
                    at: deadline,
                    generation,
                    connection,
                    key,
                }));
            }
            Command::Cancel { connection, key } => {
                self.armed.remove(&(connection, key));
            }
        }
    }

    fn next_deadline(&mut self) -> Option<Instant> {
        // Drop superseded records so an idle scheduler does not wake for them
        while let Some(Reverse(record)) = self.heap.peek() {
            if self.is_current(record) {
                return Some(record.at);
            }
            self.heap.pop();
        }
        None
    }

    fn is_current(&self, record: &DeadlineRecord) -> bool {
        self.armed
            .get(&(record.connection.clone(), record.key))
            .is_some_and(|armed| armed.generation == record.generation)
    }

    fn fire_due(&mut self, now: Instant) {
        while let Some(Reverse(record)) = self.heap.peek() {
            if record.at > now {
                break;
            }
            let Some(Reverse(record)) = self.heap.pop() else {
                break;
            };

            let slot = (record.connection, record.key);
            let token = match self.armed.get(&slot) {
                Some(armed) if armed.generation == record.generation => armed.token,
                _ => continue,
            };
            self.armed.remove(&slot);
            let (connection, key) = slot;

            let delivered = self
                .connections
                .get(&connection)
                .map(|sender| sender.send(Expired { key, token }).is_ok());

            match delivered {
                Some(true) => trace!("Deadline {:?} elapsed for {}", key, connection),
                Some(false) => {
                    debug!("Connection {} gone, dropping its timers", connection);
                    self.connections.remove(&connection);
                    self.armed.retain(|(c, _), _| *c != connection);
                }
                None => {}
            }
        }
    }
}

async fn run(mut commands: mpsc::UnboundedReceiver<Command>) {
    let mut state = SchedulerState::default();

    loop {
        let next = state.next_deadline();
        let sleep_target = next.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => state.apply(command),
                None => break,
            },
            _ = tokio::time::sleep_until(sleep_target), if next.is_some() => {
                state.fire_due(Instant::now());
            }
        }
    }

    debug!("Retry scheduler shutting down");
}

#[cfg(test)]
mod tests;
