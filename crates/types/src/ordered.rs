//! Ordered output handed to external observers.

use crate::committee::ProcessId;
use crate::hash::Hash;
use crate::transaction::Transaction;

/// One unit's position in the linear order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderedUnit {
    /// The unit's content hash.
    pub hash: Hash,
    /// The unit's creator.
    pub creator: ProcessId,
    /// The timing round that committed the unit.
    pub round: u64,
    /// The transactions the unit carried, in unit order.
    pub txs: Vec<Transaction>,
}

/// The extension of the linear order produced by one timing decision.
///
/// Batches are emitted in round order and the overall sequence is
/// append-only: a unit's position never changes once emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderedBatch {
    /// The level of the timing unit that closed this round.
    pub round: u64,
    /// Newly ordered units, in final order.
    pub units: Vec<OrderedUnit>,
}

impl OrderedBatch {
    /// Total transactions committed by this batch.
    pub fn tx_count(&self) -> usize {
        self.units.iter().map(|u| u.txs.len()).sum()
    }
}
