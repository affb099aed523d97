//! Packet identifier allocation
//!
//! Each connection owns one identifier space per direction. Outbound
//! identifiers are chosen here; inbound identifiers are chosen by the peer and
//! only claimed. An identifier stays active until its exchange terminates and
//! releases it, so a stale acknowledgment can never complete a newer exchange.

use super::error::DeliveryError;

/// Number of usable identifiers (0 is reserved)
pub const MAX_PACKET_IDS: usize = u16::MAX as usize;

const WORDS: usize = (u16::MAX as usize + 1) / 64;

/// Direction of an exchange relative to the local endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// We sent the PUBLISH
    Outbound,
    /// The peer sent the PUBLISH
    Inbound,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Outbound => f.write_str("outbound"),
            Direction::Inbound => f.write_str("inbound"),
        }
    }
}

/// Bitset over 1..=65535 with a rotating allocation cursor
#[derive(Clone)]
pub struct PacketIdAllocator {
    direction: Direction,
    used: Box<[u64; WORDS]>,
    active: usize,
    next: u16,
}

impl PacketIdAllocator {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            used: Box::new([0; WORDS]),
            active: 0,
            next: 1,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Issue the next free identifier.
    ///
    /// Scans forward from the cursor, so a just-released identifier is the
    /// last candidate to be reissued.
    pub fn allocate(&mut self) -> Result<u16, DeliveryError> {
        if self.active >= MAX_PACKET_IDS {
            return Err(DeliveryError::ExhaustedIdentifierSpace {
                direction: self.direction,
            });
        }

        loop {
            let id = self.next;
            self.next = self.next.wrapping_add(1);
            if self.next == 0 {
                self.next = 1;
            }

            if !self.is_active(id) {
                self.set(id);
                return Ok(id);
            }
        }
    }

    /// Mark a peer-chosen identifier as active
    pub fn claim(&mut self, id: u16) -> Result<(), DeliveryError> {
        if id == 0 || self.is_active(id) {
            return Err(DeliveryError::IdentifierInUse { packet_id: id });
        }
        self.set(id);
        Ok(())
    }

    /// Return an identifier to the free pool. Releasing a free identifier is a
    /// no-op.
    pub fn release(&mut self, id: u16) {
        if id == 0 || !self.is_active(id) {
            return;
        }
        let (word, bit) = Self::slot(id);
        self.used[word] &= !bit;
        self.active -= 1;
    }

    pub fn is_active(&self, id: u16) -> bool {
        let (word, bit) = Self::slot(id);
        id != 0 && self.used[word] & bit != 0
    }

    pub fn active_count(&self) -> usize {
        self.active
    }

    /// Iterate over all active identifiers in ascending order
    pub fn iter_active(&self) -> impl Iterator<Item = u16> + '_ {
        (1..=u16::MAX).filter(move |id| self.is_active(*id))
    }

    fn set(&mut self, id: u16) {
        let (word, bit) = Self::slot(id);
        self.used[word] |= bit;
        self.active += 1;
    }

    #[inline]
    fn slot(id: u16) -> (usize, u64) {
        ((id as usize) / 64, 1u64 << (id % 64))
    }
}

impl std::fmt::Debug for PacketIdAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketIdAllocator")
            .field("direction", &self.direction)
            .field("active", &self.active)
            .field("next", &self.next)
            .finish()
    }
}

/// The two identifier spaces of one connection
#[derive(Debug, Clone)]
pub struct PacketIds {
    pub outbound: PacketIdAllocator,
    pub inbound: PacketIdAllocator,
}

impl PacketIds {
    pub fn new() -> Self {
        Self {
            outbound: PacketIdAllocator::new(Direction::Outbound),
            inbound: PacketIdAllocator::new(Direction::Inbound),
        }
    }

    pub fn get(&self, direction: Direction) -> &PacketIdAllocator {
        match direction {
            Direction::Outbound => &self.outbound,
            Direction::Inbound => &self.inbound,
        }
    }

    pub fn get_mut(&mut self, direction: Direction) -> &mut PacketIdAllocator {
        match direction {
            Direction::Outbound => &mut self.outbound,
            Direction::Inbound => &mut self.inbound,
        }
    }
}

impl Default for PacketIds {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_allocate_skips_zero_and_increments() {
        let mut ids = PacketIdAllocator::new(Direction::Outbound);
        assert_eq!(ids.allocate().unwrap(), 1);
        assert_eq!(ids.allocate().unwrap(), 2);
        assert_eq!(ids.active_count(), 2);
    }

    #[test]
    fn test_released_id_is_not_reused_immediately() {
        let mut ids = PacketIdAllocator::new(Direction::Outbound);
        let first = ids.allocate().unwrap();
        ids.release(first);
        assert_ne!(ids.allocate().unwrap(), first);
    }

    #[test]
    fn test_release_unknown_is_noop() {
        let mut ids = PacketIdAllocator::new(Direction::Outbound);
        ids.release(42);
        ids.release(0);
        assert_eq!(ids.active_count(), 0);

        let id = ids.allocate().unwrap();
        ids.release(id);
        ids.release(id);
        assert_eq!(ids.active_count(), 0);
    }

    #[test]
    fn test_exhaustion_and_recovery() {
        let mut ids = PacketIdAllocator::new(Direction::Outbound);
        for _ in 0..MAX_PACKET_IDS {
            ids.allocate().unwrap();
        }
        assert_eq!(
            ids.allocate(),
            Err(DeliveryError::ExhaustedIdentifierSpace {
                direction: Direction::Outbound
            })
        );

        ids.release(4242);
        assert_eq!(ids.allocate().unwrap(), 4242);
    }

    #[test]
    fn test_cursor_wraps_past_max() {
        let mut ids = PacketIdAllocator::new(Direction::Outbound);
        for _ in 0..MAX_PACKET_IDS {
            ids.allocate().unwrap();
        }
        ids.release(1);
        ids.release(65535);
        // The cursor has wrapped back to 1
        assert_eq!(ids.allocate().unwrap(), 1);
        assert_eq!(ids.allocate().unwrap(), 65535);
    }

    #[test]
    fn test_claim_rejects_active_and_zero() {
        let mut ids = PacketIdAllocator::new(Direction::Inbound);
        ids.claim(7).unwrap();
        assert_eq!(
            ids.claim(7),
            Err(DeliveryError::IdentifierInUse { packet_id: 7 })
        );
        assert!(ids.claim(0).is_err());
        ids.release(7);
        ids.claim(7).unwrap();
    }

    #[test]
    fn test_directions_are_independent() {
        let mut ids = PacketIds::new();
        let out = ids.outbound.allocate().unwrap();
        ids.inbound.claim(out).unwrap();
        assert!(ids.get(Direction::Outbound).is_active(out));
        assert!(ids.get(Direction::Inbound).is_active(out));
        ids.get_mut(Direction::Inbound).release(out);
        assert!(ids.get(Direction::Outbound).is_active(out));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Allocate,
        Release(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![Just(Op::Allocate), any::<usize>().prop_map(Op::Release)]
    }

    proptest! {
        #[test]
        fn prop_active_ids_are_unique(ops in proptest::collection::vec(op(), 1..400)) {
            let mut ids = PacketIdAllocator::new(Direction::Outbound);
            let mut live: Vec<u16> = Vec::new();

            for op in ops {
                match op {
                    Op::Allocate => {
                        let id = ids.allocate().unwrap();
                        prop_assert!(id != 0);
                        prop_assert!(!live.contains(&id));
                        live.push(id);
                    }
                    Op::Release(i) if !live.is_empty() => {
                        let id = live.swap_remove(i % live.len());
                        ids.release(id);
                    }
                    Op::Release(_) => {}
                }
                prop_assert_eq!(ids.active_count(), live.len());
            }

            let unique: HashSet<u16> = live.iter().copied().collect();
            prop_assert_eq!(unique.len(), live.len());
            for id in &live {
                prop_assert!(ids.is_active(*id));
            }
        }
    }
}
