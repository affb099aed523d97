//! Receiver-side duplicate suppression for QoS 2
//!
//! A record is created the moment an inbound QoS 2 exchange is released and
//! lives until the peer has been quiet for the retention window. While it
//! exists, retransmitted PUBLISH and PUBREL packets for the identifier are
//! acknowledged again but never delivered a second time.

use std::time::Instant;

use ahash::AHashMap;

/// Identifier whose exactly-once handshake reached the released step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupRecord {
    pub packet_id: u16,
    pub released_at: Instant,
    /// Token of the retention timer that will purge this record
    pub retention_token: u64,
}

#[derive(Debug, Default)]
pub struct DedupTracker {
    records: AHashMap<u16, DedupRecord>,
}

impl DedupTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true exactly once per record lifecycle.
    ///
    /// The first query records the identifier; every later query returns
    /// false until the record is purged.
    pub fn should_deliver(&mut self, packet_id: u16, now: Instant) -> bool {
        if self.records.contains_key(&packet_id) {
            return false;
        }
        self.records.insert(
            packet_id,
            DedupRecord {
                packet_id,
                released_at: now,
                retention_token: 0,
            },
        );
        true
    }

    pub fn contains(&self, packet_id: u16) -> bool {
        self.records.contains_key(&packet_id)
    }

    pub fn get(&self, packet_id: u16) -> Option<&DedupRecord> {
        self.records.get(&packet_id)
    }

    /// Attach the retention timer token to an existing record
    pub fn set_retention_token(&mut self, packet_id: u16, token: u64) {
        if let Some(record) = self.records.get_mut(&packet_id) {
            record.retention_token = token;
        }
    }

    /// Remove a record, returning whether one existed
    pub fn purge(&mut self, packet_id: u16) -> bool {
        self.records.remove(&packet_id).is_some()
    }

    pub fn packet_ids(&self) -> impl Iterator<Item = u16> + '_ {
        self.records.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_should_deliver_once_until_purged() {
        let now = Instant::now();
        let mut dedup = DedupTracker::new();
        assert!(dedup.should_deliver(7, now));
        assert!(!dedup.should_deliver(7, now + Duration::from_secs(1)));
        assert!(!dedup.should_deliver(7, now + Duration::from_secs(2)));
        assert!(dedup.contains(7));
        // A refused query does not move the release time
        assert_eq!(dedup.get(7).map(|r| r.released_at), Some(now));

        assert!(dedup.purge(7));
        assert!(!dedup.purge(7));
        assert!(dedup.should_deliver(7, now));
    }

    #[test]
    fn test_records_are_per_identifier() {
        let now = Instant::now();
        let mut dedup = DedupTracker::new();
        assert!(dedup.should_deliver(1, now));
        assert!(dedup.should_deliver(2, now));
        assert_eq!(dedup.len(), 2);

        dedup.set_retention_token(2, 99);
        assert_eq!(dedup.get(2).map(|r| r.retention_token), Some(99));
        assert_eq!(dedup.get(1).map(|r| r.retention_token), Some(0));
    }
}
