//! Dedup buffer
//!
//! Bookkeeping for entries that have been enqueued but not yet drained.
//! It is the single place that decides whether an enqueue coalesces, which
//! entry a worker claims next, and whether a barrier target has been
//! reached. The buffer itself is not synchronized; the queue keeps it
//! behind one mutex.
//!
//! Rules:
//! - an identity has at most one pending entry; a second enqueue while it
//!   is pending replaces the payload and keeps the original position
//! - an identity has at most one entry in flight; a pending entry for an
//!   in-flight identity is skipped by [`DedupBuffer::claim`] until the
//!   in-flight store returns

use atomio_common::{EntryState, Sequence};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::hash::Hash;
use std::time::Instant;

/// Result of [`DedupBuffer::insert`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inserted {
    /// A new entry was appended
    New(Sequence),
    /// The payload replaced a pending entry with this sequence
    Coalesced(Sequence),
}

impl Inserted {
    pub const fn sequence(self) -> Sequence {
        match self {
            Self::New(seq) | Self::Coalesced(seq) => seq,
        }
    }

    pub const fn is_coalesced(self) -> bool {
        matches!(self, Self::Coalesced(_))
    }
}

struct PendingEntry<T> {
    sequence: Sequence,
    item: T,
    enqueued_at: Instant,
    replaced: u32,
}

/// An entry handed to a worker
#[derive(Debug)]
pub struct Claimed<K, T> {
    pub key: K,
    pub sequence: Sequence,
    pub item: T,
    /// How many later payloads were folded into this entry
    pub replaced: u32,
    /// When the entry was first enqueued
    pub enqueued_at: Instant,
}

/// Pending and in-flight entries keyed by identity
pub struct DedupBuffer<K, T> {
    pending: HashMap<K, PendingEntry<T>>,
    /// FIFO of pending entries by first-enqueue sequence
    order: VecDeque<(Sequence, K)>,
    in_flight: HashMap<K, Sequence>,
    /// Sequences of every entry not yet drained
    outstanding: BTreeSet<Sequence>,
    last: Sequence,
}

impl<K: Eq + Hash + Clone, T> DedupBuffer<K, T> {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
            order: VecDeque::new(),
            in_flight: HashMap::new(),
            outstanding: BTreeSet::new(),
            last: Sequence::ZERO,
        }
    }

    /// Add a payload for `key`, coalescing into a pending entry if there is one
    pub fn insert(&mut self, key: K, item: T) -> Inserted {
        if let Some(entry) = self.pending.get_mut(&key) {
            entry.item = item;
            entry.replaced += 1;
            return Inserted::Coalesced(entry.sequence);
        }

        let sequence = self.last.next();
        self.last = sequence;
        self.order.push_back((sequence, key.clone()));
        self.outstanding.insert(sequence);
        self.pending.insert(
            key,
            PendingEntry {
                sequence,
                item,
                enqueued_at: Instant::now(),
                replaced: 0,
            },
        );
        Inserted::New(sequence)
    }

    /// Take the oldest pending entry whose identity is not in flight
    pub fn claim(&mut self) -> Option<Claimed<K, T>> {
        let position = self
            .order
            .iter()
            .position(|(_, key)| !self.in_flight.contains_key(key))?;
        let (sequence, key) = self.order.remove(position)?;
        let entry = self.pending.remove(&key)?;
        debug_assert_eq!(entry.sequence, sequence);

        self.in_flight.insert(key.clone(), sequence);
        Some(Claimed {
            key,
            sequence,
            item: entry.item,
            replaced: entry.replaced,
            enqueued_at: entry.enqueued_at,
        })
    }

    /// Retire an in-flight entry
    ///
    /// Returns true if another payload for the same identity is pending and
    /// has just become claimable.
    pub fn complete(&mut self, key: &K, sequence: Sequence) -> bool {
        if self.in_flight.get(key) == Some(&sequence) {
            self.in_flight.remove(key);
        }
        self.outstanding.remove(&sequence);
        self.pending.contains_key(key)
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.pending.contains_key(key)
    }

    pub fn state_of(&self, key: &K) -> Option<EntryState> {
        match (self.in_flight.contains_key(key), self.pending.contains_key(key)) {
            (true, true) => Some(EntryState::InFlightWithPending),
            (true, false) => Some(EntryState::InFlight),
            (false, true) => Some(EntryState::Pending),
            (false, false) => None,
        }
    }

    /// Outstanding entries, pending plus in flight
    pub fn depth(&self) -> usize {
        self.outstanding.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outstanding.is_empty()
    }

    /// Sequence of the most recently created entry
    pub const fn last_assigned(&self) -> Sequence {
        self.last
    }

    pub fn oldest_outstanding(&self) -> Option<Sequence> {
        self.outstanding.first().copied()
    }

    /// Whether every entry up to and including `target` has drained
    pub fn is_drained_through(&self, target: Sequence) -> bool {
        self.oldest_outstanding().is_none_or(|oldest| oldest > target)
    }
}

impl<K: Eq + Hash + Clone, T> Default for DedupBuffer<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coalesce_keeps_position_takes_payload() {
        let mut buf = DedupBuffer::new();
        assert_eq!(buf.insert("a", 1), Inserted::New(Sequence::new(1)));
        assert_eq!(buf.insert("b", 1), Inserted::New(Sequence::new(2)));
        assert_eq!(buf.insert("a", 2), Inserted::Coalesced(Sequence::new(1)));
        assert_eq!(buf.depth(), 2);

        let first = buf.claim().unwrap();
        assert_eq!((first.key, first.item, first.replaced), ("a", 2, 1));
        assert_eq!(buf.claim().unwrap().key, "b");
        assert!(buf.claim().is_none());
    }

    #[test]
    fn test_in_flight_identity_not_claimed_twice() {
        let mut buf = DedupBuffer::new();
        buf.insert("a", 1);
        let a1 = buf.claim().unwrap();
        assert_eq!(buf.state_of(&"a"), Some(EntryState::InFlight));

        // Cannot coalesce into work already executing
        assert!(!buf.insert("a", 2).is_coalesced());
        buf.insert("b", 1);
        assert_eq!(buf.state_of(&"a"), Some(EntryState::InFlightWithPending));

        // "a" is skipped while its first store runs
        assert_eq!(buf.claim().unwrap().key, "b");
        assert!(buf.claim().is_none());

        assert!(buf.complete(&"a", a1.sequence));
        let a2 = buf.claim().unwrap();
        assert_eq!((a2.key, a2.item), ("a", 2));
        assert!(a2.sequence > a1.sequence);
    }

    #[test]
    fn test_drained_through_tracks_out_of_order_completion() {
        let mut buf = DedupBuffer::new();
        buf.insert(1, ());
        buf.insert(2, ());
        let target = buf.last_assigned();
        buf.insert(3, ());

        let one = buf.claim().unwrap();
        let two = buf.claim().unwrap();
        let three = buf.claim().unwrap();

        buf.complete(&three.key, three.sequence);
        buf.complete(&one.key, one.sequence);
        assert!(!buf.is_drained_through(target));

        buf.complete(&two.key, two.sequence);
        assert!(buf.is_drained_through(target));
        assert!(buf.is_empty());
        assert_eq!(buf.state_of(&2), None);
    }

    #[test]
    fn test_empty_buffer_is_drained() {
        let buf: DedupBuffer<u8, ()> = DedupBuffer::new();
        assert!(buf.is_drained_through(buf.last_assigned()));
        assert_eq!(buf.oldest_outstanding(), None);
    }
}
