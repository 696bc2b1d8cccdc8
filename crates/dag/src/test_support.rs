//! Shared helpers for building small posets in tests.

use crate::poset::{Poset, UnitId};
use totem_types::test_utils::test_committee;
use totem_types::{Hash, KeyPair, ProcessId, Transaction, Unit, UnitDraft};

pub(crate) struct DagBuilder {
    pub poset: Poset,
    pub keys: Vec<KeyPair>,
    counter: u8,
}

impl DagBuilder {
    pub fn new(n: usize) -> Self {
        let (_, keys) = test_committee(n);
        Self {
            poset: Poset::new(n),
            keys,
            counter: 0,
        }
    }

    /// Sign a unit with explicit fields, without inserting it.
    pub fn signed_unit(
        &self,
        creator: usize,
        height: u64,
        parents: Vec<Hash>,
        tx_seed: u8,
    ) -> Unit {
        let txs = if tx_seed == 0 {
            vec![]
        } else {
            vec![Transaction::new(vec![tx_seed])]
        };
        UnitDraft {
            creator: ProcessId(creator as u16),
            height,
            parents,
            txs,
            coin_payload: vec![],
        }
        .sign(&self.keys[creator])
    }

    pub fn add_dealing(&mut self, creator: usize) -> UnitId {
        let unit = self.signed_unit(creator, 0, vec![], 0);
        let candidate = self.poset.prepare(unit).expect("prepare dealing");
        self.poset.insert(candidate)
    }

    pub fn add_unit(&mut self, creator: usize, parents: &[UnitId]) -> UnitId {
        self.counter += 1;
        let seed = self.counter;
        self.add_unit_with_txs(creator, parents, seed)
    }

    /// Insert a unit bypassing compliance, for shaping exact DAGs.
    pub fn add_unit_with_txs(
        &mut self,
        creator: usize,
        parents: &[UnitId],
        tx_seed: u8,
    ) -> UnitId {
        let height = self.poset.height(parents[0]) + 1;
        let hashes = parents.iter().map(|&p| self.poset.hash(p)).collect();
        let unit = self.signed_unit(creator, height, hashes, tx_seed);
        let candidate = self.poset.prepare(unit).expect("prepare unit");
        self.poset.insert(candidate)
    }
}
