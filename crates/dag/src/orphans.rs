//! Buffering for units that arrived before their parents.
//!
//! Sync delivers units in sender-topological order, but across sessions
//! a child can overtake its parents. Such units wait here, indexed by
//! their missing parent hashes, and are released the moment the last
//! missing parent is inserted. The buffer is bounded and entries carry
//! a TTL; an expired orphan is dropped and will be fetched again by a
//! later sync round.

use std::collections::{HashMap, HashSet};
use std::time::Duration;
use totem_types::{Hash, ProcessId, Unit};

struct OrphanEntry {
    unit: Unit,
    source: Option<ProcessId>,
    missing: HashSet<Hash>,
    deadline: Duration,
}

/// The pending-by-missing-parent index.
pub struct OrphanBuffer {
    capacity: usize,
    ttl: Duration,
    waiting: HashMap<Hash, OrphanEntry>,
    by_missing: HashMap<Hash, Vec<Hash>>,
}

impl OrphanBuffer {
    /// An empty buffer holding at most `capacity` units for `ttl` each.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity,
            ttl,
            waiting: HashMap::new(),
            by_missing: HashMap::new(),
        }
    }

    /// Number of buffered orphans.
    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }

    /// Whether a unit with this hash is already waiting.
    pub fn contains(&self, hash: &Hash) -> bool {
        self.waiting.contains_key(hash)
    }

    /// Buffer a unit whose listed parents are missing.
    ///
    /// Returns false when the buffer is full and the unit was dropped.
    pub fn insert(
        &mut self,
        unit: Unit,
        source: Option<ProcessId>,
        missing: Vec<Hash>,
        now: Duration,
    ) -> bool {
        let hash = unit.hash();
        if self.waiting.contains_key(&hash) {
            return true;
        }
        if self.waiting.len() >= self.capacity {
            tracing::warn!(unit = ?hash, buffered = self.waiting.len(), "orphan buffer full, dropping unit");
            return false;
        }
        for parent in &missing {
            self.by_missing.entry(*parent).or_default().push(hash);
        }
        tracing::debug!(unit = ?hash, missing = missing.len(), "unit buffered awaiting parents");
        self.waiting.insert(
            hash,
            OrphanEntry {
                unit,
                source,
                missing: missing.into_iter().collect(),
                deadline: now + self.ttl,
            },
        );
        true
    }

    /// Note that a unit was inserted into the poset; returns any
    /// orphans whose last missing parent this was, ready to retry.
    pub fn on_unit_added(&mut self, hash: &Hash) -> Vec<(Unit, Option<ProcessId>)> {
        let Some(waiters) = self.by_missing.remove(hash) else {
            return Vec::new();
        };
        let mut ready = Vec::new();
        for waiter in waiters {
            let complete = match self.waiting.get_mut(&waiter) {
                Some(entry) => {
                    entry.missing.remove(hash);
                    entry.missing.is_empty()
                }
                // Already expired.
                None => false,
            };
            if complete {
                if let Some(entry) = self.waiting.remove(&waiter) {
                    ready.push((entry.unit, entry.source));
                }
            }
        }
        ready
    }

    /// Drop entries past their deadline; returns how many were evicted.
    pub fn sweep(&mut self, now: Duration) -> usize {
        let expired: Vec<Hash> = self
            .waiting
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(hash, _)| *hash)
            .collect();
        for hash in &expired {
            self.waiting.remove(hash);
            tracing::debug!(unit = ?hash, "orphan expired");
        }
        // Index entries pointing at dropped units are cleaned lazily in
        // on_unit_added.
        expired.len()
    }
}
