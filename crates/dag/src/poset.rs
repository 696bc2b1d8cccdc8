//! The poset: an append-only DAG of units.
//!
//! Units live in an arena indexed by [`UnitId`]; floors and every other
//! cross-reference hold ids, never owning pointers, so the cyclic
//! unit/floor shape never arises. The poset is the single source of
//! truth for the `below` relation, levels, prime units and fork
//! bookkeeping.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, BTreeMap, HashMap, HashSet};
use thiserror::Error;
use totem_types::{Hash, ProcessId, Unit};

/// Index of a unit inside its poset's arena.
///
/// Ids are assigned in insertion order and are only meaningful within
/// the poset that issued them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnitId(u32);

impl UnitId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

struct UnitEntry {
    unit: Unit,
    parents: Vec<UnitId>,
    /// Per process, the maximal units of that process strictly below
    /// this unit (the creator's slot holds the predecessor).
    floor: Vec<Vec<UnitId>>,
    level: u64,
    prime: bool,
}

/// A unit that passed preparation: parents resolved, floor and level
/// computed, ready for compliance checking and insertion.
#[derive(Debug)]
pub struct Candidate {
    pub(crate) unit: Unit,
    pub(crate) parents: Vec<UnitId>,
    pub(crate) floor: Vec<Vec<UnitId>>,
    pub(crate) level: u64,
    pub(crate) prime: bool,
}

impl Candidate {
    /// The unit being inserted.
    pub fn unit(&self) -> &Unit {
        &self.unit
    }

    /// The computed level.
    pub fn level(&self) -> u64 {
        self.level
    }

    /// Whether the unit is prime at its level.
    pub fn prime(&self) -> bool {
        self.prime
    }

    /// Resolved parent ids, predecessor first.
    pub fn parents(&self) -> &[UnitId] {
        &self.parents
    }
}

/// Errors preparing a unit for insertion.
#[derive(Debug, Error)]
pub enum PrepareError {
    #[error("creator id {0} outside the committee")]
    CreatorOutOfRange(ProcessId),

    #[error("unit already present")]
    Duplicate,

    #[error("{} parents missing from the poset", .0.len())]
    MissingParents(Vec<Hash>),
}

/// The per-process, append-only DAG of units.
pub struct Poset {
    n: usize,
    units: Vec<UnitEntry>,
    by_hash: HashMap<Hash, UnitId>,
    by_creator: Vec<Vec<UnitId>>,
    /// Globally maximal units, least recently added first.
    max_units: Vec<UnitId>,
    /// Per process, the maximal units by that creator. A singleton for
    /// honest processes; forks make it grow.
    max_per_process: Vec<Vec<UnitId>>,
    /// Minimal height at which each process was seen forking.
    forking_height: Vec<Option<u64>>,
    /// level -> per-process prime units, each list sorted by hash so
    /// every process iterates fork duplicates identically.
    prime_index: BTreeMap<u64, Vec<Vec<UnitId>>>,
    dealing_units: Vec<Vec<UnitId>>,
    level_reached: u64,
}

impl Poset {
    /// An empty poset for a committee of `n` processes.
    pub fn new(n: usize) -> Self {
        Self {
            n,
            units: Vec::new(),
            by_hash: HashMap::new(),
            by_creator: vec![Vec::new(); n],
            max_units: Vec::new(),
            max_per_process: vec![Vec::new(); n],
            forking_height: vec![None; n],
            prime_index: BTreeMap::new(),
            dealing_units: vec![Vec::new(); n],
            level_reached: 0,
        }
    }

    /// Committee size N.
    pub fn committee_size(&self) -> usize {
        self.n
    }

    /// Number of units in the poset.
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Whether the poset holds no units.
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Highest level any unit has reached.
    pub fn level_reached(&self) -> u64 {
        self.level_reached
    }

    /// All unit ids, in insertion order.
    pub fn ids(&self) -> impl Iterator<Item = UnitId> {
        (0..self.units.len() as u32).map(UnitId)
    }

    /// Whether `count` processes form a 2/3 supermajority.
    pub fn is_quorum(&self, count: usize) -> bool {
        3 * count >= 2 * self.n
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Lookup
    // ═══════════════════════════════════════════════════════════════════════

    /// Whether a unit with this hash is present.
    pub fn contains(&self, hash: &Hash) -> bool {
        self.by_hash.contains_key(hash)
    }

    /// The id of a unit by hash.
    pub fn id_of(&self, hash: &Hash) -> Option<UnitId> {
        self.by_hash.get(hash).copied()
    }

    /// The unit stored under `id`.
    pub fn unit(&self, id: UnitId) -> &Unit {
        &self.units[id.index()].unit
    }

    /// The unit's content hash.
    pub fn hash(&self, id: UnitId) -> Hash {
        self.units[id.index()].unit.hash()
    }

    /// The unit's creator.
    pub fn creator(&self, id: UnitId) -> ProcessId {
        self.units[id.index()].unit.creator()
    }

    /// The unit's height in its creator's chain.
    pub fn height(&self, id: UnitId) -> u64 {
        self.units[id.index()].unit.height()
    }

    /// The unit's level.
    pub fn level(&self, id: UnitId) -> u64 {
        self.units[id.index()].level
    }

    /// Whether the unit is prime at its level.
    pub fn is_prime(&self, id: UnitId) -> bool {
        self.units[id.index()].prime
    }

    /// Resolved parent ids, predecessor first.
    pub fn parents(&self, id: UnitId) -> &[UnitId] {
        &self.units[id.index()].parents
    }

    /// The unit's floor entry for `pid`.
    pub fn floor(&self, id: UnitId, pid: ProcessId) -> &[UnitId] {
        &self.units[id.index()].floor[pid.index()]
    }

    /// Globally maximal units, least recently added first.
    pub fn max_units(&self) -> &[UnitId] {
        &self.max_units
    }

    /// Maximal units created by `pid`.
    pub fn tips(&self, pid: ProcessId) -> &[UnitId] {
        &self.max_per_process[pid.index()]
    }

    /// The creator's own latest unit, used as the next predecessor.
    pub fn latest_own(&self, pid: ProcessId) -> Option<UnitId> {
        self.max_per_process[pid.index()].last().copied()
    }

    /// Height and hash of the maximal known unit by `pid`, favouring
    /// the higher (then lexicographically larger) tip under forks.
    pub fn max_tip(&self, pid: ProcessId) -> Option<(u64, Hash)> {
        self.max_per_process[pid.index()]
            .iter()
            .map(|&id| (self.height(id), self.hash(id)))
            .max()
    }

    /// All units by `pid` with height in `(above, up_to]`.
    pub fn units_by_creator_in_range(
        &self,
        pid: ProcessId,
        above: Option<u64>,
        up_to: u64,
    ) -> Vec<UnitId> {
        self.by_creator[pid.index()]
            .iter()
            .copied()
            .filter(|&id| {
                let h = self.height(id);
                h <= up_to && above.map_or(true, |a| h > a)
            })
            .collect()
    }

    /// Dealing units seen from `pid`; more than one means a fork at
    /// height zero.
    pub fn dealing_units(&self, pid: ProcessId) -> &[UnitId] {
        &self.dealing_units[pid.index()]
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Forker bookkeeping
    // ═══════════════════════════════════════════════════════════════════════

    /// Whether `pid` has been observed forking.
    pub fn is_forker(&self, pid: ProcessId) -> bool {
        self.forking_height[pid.index()].is_some()
    }

    /// The minimal height at which `pid` was seen forking.
    pub fn forking_height(&self, pid: ProcessId) -> Option<u64> {
        self.forking_height[pid.index()]
    }

    /// All processes observed forking so far. Monotone over a run.
    pub fn forkers(&self) -> Vec<ProcessId> {
        (0..self.n as u16)
            .map(ProcessId)
            .filter(|&pid| self.is_forker(pid))
            .collect()
    }

    /// Whether the unit's lower cone contains evidence that `pid`
    /// forked: two incomparable units in its floor slot.
    pub fn has_forking_evidence(&self, id: UnitId, pid: ProcessId) -> bool {
        self.units[id.index()].floor[pid.index()].len() > 1
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Prime units
    // ═══════════════════════════════════════════════════════════════════════

    /// All prime units at `level`, grouped per process, fork duplicates
    /// in hash order.
    pub fn primes_at(&self, level: u64) -> Vec<UnitId> {
        match self.prime_index.get(&level) {
            Some(per_process) => per_process.iter().flatten().copied().collect(),
            None => Vec::new(),
        }
    }

    /// Prime units at `level` created by `pid`, in hash order.
    pub fn primes_of(&self, level: u64, pid: ProcessId) -> &[UnitId] {
        static EMPTY: Vec<UnitId> = Vec::new();
        self.prime_index
            .get(&level)
            .map(|per_process| &per_process[pid.index()])
            .unwrap_or(&EMPTY)
    }

    /// Prime units at `level` below the unit `id`.
    pub fn primes_below(&self, level: u64, id: UnitId) -> Vec<UnitId> {
        self.primes_at(level)
            .into_iter()
            .filter(|&q| self.below(q, id))
            .collect()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // The below relation
    // ═══════════════════════════════════════════════════════════════════════

    /// Whether `a <= b`: a parent path leads from `b` down to `a`.
    ///
    /// Constant time in the no-fork case: a floor lookup plus a height
    /// comparison.
    pub fn below(&self, a: UnitId, b: UnitId) -> bool {
        if a == b {
            return true;
        }
        self.units[b.index()].floor[self.creator(a).index()]
            .iter()
            .any(|&w| self.below_within_process(a, w))
    }

    /// Whether `a <= candidate`, evaluated against a floor that is not
    /// yet inserted.
    pub fn below_floor(&self, a: UnitId, floor: &[Vec<UnitId>]) -> bool {
        floor[self.creator(a).index()]
            .iter()
            .any(|&w| self.below_within_process(a, w))
    }

    /// Whether `a <= b` along same-creator predecessor edges only.
    ///
    /// Below the creator's forking height a height comparison suffices;
    /// past it, walk predecessors from `b` down to `a`'s height.
    pub fn below_within_process(&self, a: UnitId, b: UnitId) -> bool {
        let creator = self.creator(a);
        debug_assert_eq!(creator, self.creator(b));
        let (ha, hb) = (self.height(a), self.height(b));
        if ha > hb {
            return false;
        }
        match self.forking_height[creator.index()] {
            None => true,
            Some(fh) if ha < fh => true,
            _ => {
                let mut w = b;
                while self.height(w) > ha {
                    w = self.units[w.index()].parents[0];
                }
                w == a
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Preparation and insertion
    // ═══════════════════════════════════════════════════════════════════════

    /// The parent hashes of `unit` that are not in the poset yet.
    ///
    /// Callers buffer units with missing parents instead of preparing
    /// them.
    pub fn missing_parents(&self, unit: &Unit) -> Vec<Hash> {
        unit.parents()
            .iter()
            .filter(|hash| !self.contains(hash))
            .copied()
            .collect()
    }

    /// Resolve a unit's parents and compute its floor, level and prime
    /// flag. Fails when parents are missing (orphan) without mutating
    /// anything.
    pub fn prepare(&self, unit: Unit) -> Result<Candidate, PrepareError> {
        if unit.creator().index() >= self.n {
            return Err(PrepareError::CreatorOutOfRange(unit.creator()));
        }
        if self.contains(&unit.hash()) {
            return Err(PrepareError::Duplicate);
        }
        let mut parents = Vec::with_capacity(unit.parents().len());
        let mut missing = Vec::new();
        for hash in unit.parents() {
            match self.id_of(hash) {
                Some(id) => parents.push(id),
                None => missing.push(*hash),
            }
        }
        if !missing.is_empty() {
            return Err(PrepareError::MissingParents(missing));
        }
        let (floor, level, prime) = self.prepare_parts(&parents);
        Ok(Candidate {
            unit,
            parents,
            floor,
            level,
            prime,
        })
    }

    /// Floor, level and prime flag for a unit with the given parents.
    ///
    /// Also used by the creator before the unit exists, to decide
    /// whether the new unit will be prime (and so must carry a coin
    /// share) prior to signing.
    pub fn prepare_parts(&self, parents: &[UnitId]) -> (Vec<Vec<UnitId>>, u64, bool) {
        if parents.is_empty() {
            return (vec![Vec::new(); self.n], 0, true);
        }
        let floor: Vec<Vec<UnitId>> = (0..self.n as u16)
            .map(|pid| self.combine_floors(parents, ProcessId(pid)))
            .collect();

        // Let m be the max level among parents; the unit's level is m,
        // or m+1 when prime units of a supermajority of creators at
        // level m lie below it.
        let m = parents.iter().map(|&p| self.level(p)).max().unwrap_or(0);
        let mut creators_below = 0usize;
        for pid in 0..self.n {
            let primes = self.primes_of(m, ProcessId(pid as u16));
            if primes.iter().any(|&q| self.below_floor(q, &floor)) {
                creators_below += 1;
            }
            // Stop early once a quorum is out of reach.
            if !self.is_quorum(creators_below + self.n - 1 - pid) {
                break;
            }
        }
        let level = if self.is_quorum(creators_below) { m + 1 } else { m };
        let prime = level > self.level(parents[0]);
        (floor, level, prime)
    }

    /// Union-of-maximals of the parents' floors for one process, with
    /// each parent inserted into its own creator's slot first.
    fn combine_floors(&self, parents: &[UnitId], pid: ProcessId) -> Vec<UnitId> {
        let mut result: Vec<UnitId> = Vec::with_capacity(1);
        let candidates = parents
            .iter()
            .flat_map(|&p| self.units[p.index()].floor[pid.index()].iter().copied())
            .chain(parents.iter().copied().filter(|&p| self.creator(p) == pid));

        for candidate in candidates {
            let mut comparable = false;
            let mut replace = None;
            for (i, &held) in result.iter().enumerate() {
                if self.below_within_process(held, candidate) {
                    comparable = true;
                    replace = Some(i);
                    break;
                }
                if self.below_within_process(candidate, held) {
                    comparable = true;
                    break;
                }
            }
            if let Some(i) = replace {
                result[i] = candidate;
            } else if !comparable {
                result.push(candidate);
            }
        }
        result
    }

    /// Insert a prepared, compliant unit.
    ///
    /// Updates the maximal-unit lists, fork bookkeeping, the prime
    /// index and the dealing-unit registry. Units are never removed.
    pub fn insert(&mut self, candidate: Candidate) -> UnitId {
        let Candidate {
            unit,
            parents,
            floor,
            level,
            prime,
        } = candidate;
        let id = UnitId(self.units.len() as u32);
        let hash = unit.hash();
        let creator = unit.creator();
        let height = unit.height();

        let parent_set: HashSet<UnitId> = parents.iter().copied().collect();
        self.max_units.retain(|u| !parent_set.contains(u));
        self.max_units.push(id);

        if parents.is_empty() {
            if !self.max_per_process[creator.index()].is_empty() {
                self.mark_forker(creator, 0);
            }
            self.max_per_process[creator.index()].push(id);
            self.dealing_units[creator.index()].push(id);
        } else {
            let predecessor = parents[0];
            let tips = &mut self.max_per_process[creator.index()];
            if let Some(pos) = tips.iter().position(|&u| u == predecessor) {
                tips.remove(pos);
                tips.push(id);
            } else {
                tips.push(id);
                self.mark_forker(creator, height);
            }
        }

        self.level_reached = self.level_reached.max(level);
        self.by_hash.insert(hash, id);
        self.by_creator[creator.index()].push(id);
        self.units.push(UnitEntry {
            unit,
            parents,
            floor,
            level,
            prime,
        });

        if prime {
            let per_process = self
                .prime_index
                .entry(level)
                .or_insert_with(|| vec![Vec::new(); self.n]);
            let list = &mut per_process[creator.index()];
            list.push(id);
            // Fork duplicates must be iterated in the same order by
            // every process.
            if list.len() > 1 {
                let hashes: Vec<Hash> = list.iter().map(|&u| self.units[u.index()].unit.hash()).collect();
                let mut keyed: Vec<(Hash, UnitId)> =
                    hashes.into_iter().zip(list.iter().copied()).collect();
                keyed.sort();
                *list = keyed.into_iter().map(|(_, u)| u).collect();
            }
        }

        tracing::trace!(
            unit = ?hash,
            creator = creator.0,
            height,
            level,
            prime,
            "unit inserted"
        );
        id
    }

    fn mark_forker(&mut self, pid: ProcessId, height: u64) {
        let slot = &mut self.forking_height[pid.index()];
        let updated = slot.map_or(height, |h| h.min(height));
        if slot.map_or(true, |h| updated < h) {
            *slot = Some(updated);
            tracing::warn!(process = pid.0, height = updated, "fork observed");
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Topological order
    // ═══════════════════════════════════════════════════════════════════════

    /// Sort a set of units topologically, parents before children,
    /// breaking ties by `(level, creator, hash)`.
    pub fn topological_sort(&self, ids: &[UnitId]) -> Vec<UnitId> {
        let subset: HashSet<UnitId> = ids.iter().copied().collect();
        let mut blocking: HashMap<UnitId, usize> = HashMap::with_capacity(ids.len());
        let mut children: HashMap<UnitId, Vec<UnitId>> = HashMap::new();
        for &id in ids {
            let mut count = 0;
            for &parent in self.parents(id) {
                if subset.contains(&parent) {
                    children.entry(parent).or_default().push(id);
                    count += 1;
                }
            }
            blocking.insert(id, count);
        }

        let mut ready: BinaryHeap<Reverse<(u64, u16, Hash, UnitId)>> = blocking
            .iter()
            .filter(|(_, &count)| count == 0)
            .map(|(&id, _)| Reverse(self.order_key(id)))
            .collect();

        let mut result = Vec::with_capacity(ids.len());
        while let Some(Reverse((_, _, _, id))) = ready.pop() {
            result.push(id);
            if let Some(kids) = children.get(&id) {
                for &child in kids {
                    if let Some(count) = blocking.get_mut(&child) {
                        *count -= 1;
                        if *count == 0 {
                            ready.push(Reverse(self.order_key(child)));
                        }
                    }
                }
            }
        }
        debug_assert_eq!(result.len(), ids.len());
        result
    }

    fn order_key(&self, id: UnitId) -> (u64, u16, Hash, UnitId) {
        (self.level(id), self.creator(id).0, self.hash(id), id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::DagBuilder;

    #[test]
    fn dealing_units_are_level_zero_primes() {
        let mut dag = DagBuilder::new(4);
        let d0 = dag.add_dealing(0);
        assert_eq!(dag.poset.level(d0), 0);
        assert!(dag.poset.is_prime(d0));
        assert_eq!(dag.poset.dealing_units(ProcessId(0)), &[d0]);
        assert_eq!(dag.poset.max_units(), &[d0]);
    }

    #[test]
    fn floors_track_maximal_units_per_process() {
        let mut dag = DagBuilder::new(4);
        let deals: Vec<UnitId> = (0..4).map(|i| dag.add_dealing(i)).collect();
        // Unit by 0 on top of every dealing unit.
        let u = dag.add_unit(0, &[deals[0], deals[1], deals[2], deals[3]]);
        for (i, &d) in deals.iter().enumerate() {
            assert_eq!(dag.poset.floor(u, ProcessId(i as u16)), &[d]);
        }
        // The creator's slot holds the predecessor, not the unit itself.
        assert_eq!(dag.poset.floor(u, ProcessId(0)), &[deals[0]]);
    }

    #[test]
    fn below_follows_parent_paths() {
        let mut dag = DagBuilder::new(4);
        let d0 = dag.add_dealing(0);
        let d1 = dag.add_dealing(1);
        let d2 = dag.add_dealing(2);
        let u = dag.add_unit(0, &[d0, d1]);
        assert!(dag.poset.below(d0, u));
        assert!(dag.poset.below(d1, u));
        assert!(!dag.poset.below(d2, u));
        assert!(!dag.poset.below(u, d0));
        // Reflexive.
        assert!(dag.poset.below(u, u));
    }

    #[test]
    fn level_advances_on_supermajority() {
        let mut dag = DagBuilder::new(4);
        let deals: Vec<UnitId> = (0..4).map(|i| dag.add_dealing(i)).collect();
        // A unit above 3 of 4 level-0 primes reaches level 1 (quorum is 3).
        let u = dag.add_unit(0, &[deals[0], deals[1], deals[2]]);
        assert_eq!(dag.poset.level(u), 1);
        assert!(dag.poset.is_prime(u));
        assert_eq!(dag.poset.primes_of(1, ProcessId(0)), &[u]);

        // A unit above only 2 of 4 stays at level 0 and is not prime.
        let v = dag.add_unit(1, &[deals[1], deals[3]]);
        assert_eq!(dag.poset.level(v), 0);
        assert!(!dag.poset.is_prime(v));
    }

    #[test]
    fn fork_is_detected_and_floors_widen() {
        let mut dag = DagBuilder::new(4);
        let deals: Vec<UnitId> = (0..4).map(|i| dag.add_dealing(i)).collect();
        // Process 2 forks: two children of its dealing unit.
        let f1 = dag.add_unit_with_txs(2, &[deals[2], deals[0]], 1);
        let f2 = dag.add_unit_with_txs(2, &[deals[2], deals[1]], 2);
        assert!(dag.poset.is_forker(ProcessId(2)));
        assert_eq!(dag.poset.forking_height(ProcessId(2)), Some(1));
        assert_eq!(dag.poset.forkers(), vec![ProcessId(2)]);
        assert!(!dag.poset.below_within_process(f1, f2));

        // A unit above both fork branches carries two-element floor
        // evidence for process 2.
        let u = dag.add_unit(0, &[deals[0], f1, f2]);
        assert_eq!(dag.poset.floor(u, ProcessId(2)).len(), 2);
        assert!(dag.poset.has_forking_evidence(u, ProcessId(2)));
    }

    #[test]
    fn max_tip_prefers_higher_units() {
        let mut dag = DagBuilder::new(4);
        let d0 = dag.add_dealing(0);
        let d1 = dag.add_dealing(1);
        let u = dag.add_unit(0, &[d0, d1]);
        let (height, hash) = dag.poset.max_tip(ProcessId(0)).unwrap();
        assert_eq!(height, 1);
        assert_eq!(hash, dag.poset.hash(u));
        assert!(dag.poset.max_tip(ProcessId(3)).is_none());
    }

    #[test]
    fn topological_sort_respects_parents() {
        let mut dag = DagBuilder::new(4);
        let deals: Vec<UnitId> = (0..4).map(|i| dag.add_dealing(i)).collect();
        let u = dag.add_unit(0, &[deals[0], deals[1], deals[2]]);
        let v = dag.add_unit(1, &[deals[1], u]);
        let mut ids = vec![v, u, deals[2], deals[0], deals[1]];
        let sorted = dag.poset.topological_sort(&ids);
        let position: HashMap<UnitId, usize> =
            sorted.iter().enumerate().map(|(i, &id)| (id, i)).collect();
        for &id in &sorted {
            for &parent in dag.poset.parents(id) {
                if position.contains_key(&parent) {
                    assert!(position[&parent] < position[&id]);
                }
            }
        }
        // Deterministic under permutation of the input.
        ids.reverse();
        assert_eq!(dag.poset.topological_sort(&ids), sorted);
    }

    #[test]
    fn duplicate_units_are_rejected_at_prepare() {
        let mut dag = DagBuilder::new(4);
        let d0 = dag.add_dealing(0);
        let unit = dag.poset.unit(d0).clone();
        assert!(matches!(
            dag.poset.prepare(unit),
            Err(PrepareError::Duplicate)
        ));
    }

    #[test]
    fn missing_parents_reported() {
        // A child built in one poset is an orphan in an empty one.
        let mut donor = DagBuilder::new(4);
        let d = donor.add_dealing(1);
        let child = donor.signed_unit(1, 1, vec![donor.poset.hash(d)], 0);

        let empty = DagBuilder::new(4);
        match empty.poset.prepare(child) {
            Err(PrepareError::MissingParents(missing)) => assert_eq!(missing.len(), 1),
            other => panic!("expected missing parents, got {other:?}"),
        }
    }
}

