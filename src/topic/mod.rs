//! Subscription lookup
//!
//! The router only needs to know which connections want a topic and at what
//! QoS ceiling. [`SubscriptionLookup`] is that seam; [`SubscriptionStore`] is
//! the bundled implementation, which matches topic names exactly. Wildcard
//! matching belongs to alternative implementations.

use std::fmt;
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;

use crate::protocol::QoS;
use crate::session::ConnectionId;

/// A subscribing connection and the QoS it was granted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriber {
    pub connection: ConnectionId,
    pub qos: QoS,
}

/// Resolves the subscriber set of a topic
pub trait SubscriptionLookup: Send + Sync {
    /// Subscribers of `topic`, in the order they subscribed
    fn match_subscribers(&self, topic: &str) -> Vec<Subscriber>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicError {
    Empty,
    TooLong,
    NullCharacter,
    /// `+` and `#` are not supported by exact matching
    Wildcard,
}

impl fmt::Display for TopicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "topic cannot be empty"),
            Self::TooLong => write!(f, "topic exceeds 65535 bytes"),
            Self::NullCharacter => write!(f, "topic contains null character"),
            Self::Wildcard => write!(f, "topic contains wildcard"),
        }
    }
}

impl std::error::Error for TopicError {}

/// Validate a topic name (also used for exact-match filters)
pub fn validate_topic_name(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    if topic.len() > 65535 {
        return Err(TopicError::TooLong);
    }
    if topic.contains('\0') {
        return Err(TopicError::NullCharacter);
    }
    if topic.contains('+') || topic.contains('#') {
        return Err(TopicError::Wildcard);
    }
    Ok(())
}

/// Thread-safe exact-match subscription store
pub struct SubscriptionStore {
    topics: RwLock<AHashMap<Arc<str>, Vec<Subscriber>>>,
}

impl SubscriptionStore {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(AHashMap::new()),
        }
    }

    /// Add a subscription. Subscribing again keeps the original position
    /// and updates the granted QoS.
    pub fn subscribe(
        &self,
        topic: &str,
        connection: ConnectionId,
        qos: QoS,
    ) -> Result<(), TopicError> {
        validate_topic_name(topic)?;

        let mut topics = self.topics.write();
        let subs = topics.entry(Arc::from(topic)).or_default();
        match subs.iter_mut().find(|s| s.connection == connection) {
            Some(existing) => existing.qos = qos,
            None => subs.push(Subscriber { connection, qos }),
        }
        Ok(())
    }

    /// Remove a subscription
    pub fn unsubscribe(&self, topic: &str, connection: &str) -> bool {
        let mut topics = self.topics.write();
        if let Some(subs) = topics.get_mut(topic) {
            let len_before = subs.len();
            subs.retain(|s| s.connection.as_ref() != connection);
            let removed = subs.len() != len_before;
            if subs.is_empty() {
                topics.remove(topic);
            }
            removed
        } else {
            false
        }
    }

    /// Remove all subscriptions for a connection
    pub fn remove_connection(&self, connection: &str) {
        let mut topics = self.topics.write();
        topics.retain(|_, subs| {
            subs.retain(|s| s.connection.as_ref() != connection);
            !subs.is_empty()
        });
    }

    /// Number of (topic, connection) pairs
    pub fn len(&self) -> usize {
        self.topics.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.read().is_empty()
    }
}

impl SubscriptionLookup for SubscriptionStore {
    fn match_subscribers(&self, topic: &str) -> Vec<Subscriber> {
        self.topics.read().get(topic).cloned().unwrap_or_default()
    }
}

impl Default for SubscriptionStore {
    fn default() -> Self {
        Self::new()
    }
}
