//! Extension of the linear order.
//!
//! Each decided timing unit closes a *timing round*: every unit in its
//! lower cone that no earlier timing unit already ordered is appended,
//! in topological order tie-broken by `(level, creator, hash)`. The
//! resulting prefix is append-only and identical on every process with
//! the same timing decisions.

use std::collections::HashSet;
use totem_dag::{Poset, UnitId};

/// Tracks which units have been ordered and appends timing rounds.
#[derive(Default)]
pub struct Extender {
    ordered: HashSet<UnitId>,
    total: usize,
}

impl Extender {
    /// A fresh extender with an empty order.
    pub fn new() -> Self {
        Self::default()
    }

    /// Units ordered so far.
    pub fn len(&self) -> usize {
        self.total
    }

    /// Whether nothing has been ordered yet.
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Whether the unit already has a position in the order.
    pub fn is_ordered(&self, id: UnitId) -> bool {
        self.ordered.contains(&id)
    }

    /// Append the round closed by `timing`, returning the newly ordered
    /// units in their final positions.
    pub fn extend(&mut self, poset: &Poset, timing: UnitId) -> Vec<UnitId> {
        // Anything already ordered has all its ancestors ordered too,
        // so the walk can stop at ordered units without descending.
        let mut round = Vec::new();
        let mut visited: HashSet<UnitId> = HashSet::from([timing]);
        let mut stack = vec![timing];
        while let Some(unit) = stack.pop() {
            if self.ordered.contains(&unit) {
                continue;
            }
            round.push(unit);
            for &parent in poset.parents(unit) {
                if visited.insert(parent) {
                    stack.push(parent);
                }
            }
        }

        let sorted = poset.topological_sort(&round);
        for &unit in &sorted {
            self.ordered.insert(unit);
        }
        self.total += sorted.len();
        sorted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use totem_types::test_utils::test_committee;
    use totem_types::{ProcessId, UnitDraft};

    fn dealing(poset: &mut Poset, keys: &[totem_types::KeyPair], creator: usize) -> UnitId {
        let unit = UnitDraft {
            creator: ProcessId(creator as u16),
            height: 0,
            parents: vec![],
            txs: vec![],
            coin_payload: vec![],
        }
        .sign(&keys[creator]);
        let candidate = poset.prepare(unit).unwrap();
        poset.insert(candidate)
    }

    fn child(
        poset: &mut Poset,
        keys: &[totem_types::KeyPair],
        creator: usize,
        parents: &[UnitId],
    ) -> UnitId {
        let unit = UnitDraft {
            creator: ProcessId(creator as u16),
            height: poset.height(parents[0]) + 1,
            parents: parents.iter().map(|&p| poset.hash(p)).collect(),
            txs: vec![],
            coin_payload: vec![],
        }
        .sign(&keys[creator]);
        let candidate = poset.prepare(unit).unwrap();
        poset.insert(candidate)
    }

    #[test]
    fn rounds_are_disjoint_and_parent_closed() {
        let (_, keys) = test_committee(4);
        let mut poset = Poset::new(4);
        let deals: Vec<_> = (0..4).map(|i| dealing(&mut poset, &keys, i)).collect();
        let u = child(&mut poset, &keys, 0, &[deals[0], deals[1], deals[2]]);
        let v = child(&mut poset, &keys, 1, &[deals[1], u, deals[3]]);

        let mut extender = Extender::new();
        let first = extender.extend(&poset, u);
        // The round holds u and its whole unordered cone.
        assert!(first.contains(&u));
        assert_eq!(first.len(), 4);
        let positions: HashMap<UnitId, usize> =
            first.iter().enumerate().map(|(i, &id)| (id, i)).collect();
        for &id in &first {
            for &parent in poset.parents(id) {
                if let Some(&p) = positions.get(&parent) {
                    assert!(p < positions[&id]);
                }
            }
        }

        // The next round orders only what the first left out.
        let second = extender.extend(&poset, v);
        assert_eq!(second.len(), 2);
        assert!(second.contains(&v));
        assert!(second.contains(&deals[3]));
        assert!(!second.iter().any(|id| first.contains(id)));
        assert_eq!(extender.len(), 6);
    }

    #[test]
    fn extension_is_append_only_under_growth() {
        let (_, keys) = test_committee(4);
        let mut poset = Poset::new(4);
        let deals: Vec<_> = (0..4).map(|i| dealing(&mut poset, &keys, i)).collect();
        let u = child(&mut poset, &keys, 0, &[deals[0], deals[1], deals[2]]);

        let mut early = Extender::new();
        let early_round = early.extend(&poset, u);

        // A poset that has grown since produces the same round for the
        // same timing unit.
        let _later_units = child(&mut poset, &keys, 3, &[deals[3], u]);
        let mut late = Extender::new();
        let late_round = late.extend(&poset, u);
        assert_eq!(early_round, late_round);
    }
}
