//! Mempool state.

use std::collections::VecDeque;
use std::time::Duration;
use totem_core::{Action, Event, SubStateMachine};
use totem_types::Transaction;

/// Transaction queue state machine.
///
/// A bounded FIFO of opaque transactions awaiting inclusion in a unit.
/// Uses `VecDeque` without interior locking since access is serialized
/// through the arbiter.
pub struct MempoolState {
    queue: VecDeque<Transaction>,
    capacity: usize,
    dropped: u64,
    now: Duration,
}

impl MempoolState {
    /// An empty queue bounded by `capacity`.
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity,
            dropped: 0,
            now: Duration::ZERO,
        }
    }

    /// Queued transactions.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether no transactions are waiting.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Transactions dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Accept a transaction from a client.
    pub fn on_transaction_submitted(&mut self, tx: Transaction) -> Vec<Action> {
        if self.queue.len() >= self.capacity {
            self.dropped += 1;
            tracing::warn!(
                queued = self.queue.len(),
                dropped = self.dropped,
                "mempool full, dropping transaction"
            );
            return Vec::new();
        }
        self.queue.push_back(tx);
        tracing::trace!(queued = self.queue.len(), "transaction queued");
        Vec::new()
    }

    /// Take up to `max` transactions for the next unit, oldest first.
    pub fn take_batch(&mut self, max: usize) -> Vec<Transaction> {
        let count = max.min(self.queue.len());
        self.queue.drain(..count).collect()
    }

    /// Put a taken batch back at the head, preserving order.
    ///
    /// Used when unit creation declines after the batch was drawn.
    pub fn requeue_front(&mut self, txs: Vec<Transaction>) {
        for tx in txs.into_iter().rev() {
            self.queue.push_front(tx);
        }
    }
}

impl SubStateMachine for MempoolState {
    fn try_handle(&mut self, event: &Event) -> Option<Vec<Action>> {
        match event {
            Event::TransactionSubmitted { tx } => Some(self.on_transaction_submitted(tx.clone())),
            _ => None,
        }
    }

    fn set_time(&mut self, now: Duration) {
        self.now = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use totem_types::test_utils::test_tx;

    #[test]
    fn fifo_batches() {
        let mut pool = MempoolState::new(100);
        for seed in 0..5 {
            pool.on_transaction_submitted(test_tx(seed));
        }
        let batch = pool.take_batch(3);
        assert_eq!(batch, vec![test_tx(0), test_tx(1), test_tx(2)]);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn requeue_preserves_order() {
        let mut pool = MempoolState::new(100);
        for seed in 0..4 {
            pool.on_transaction_submitted(test_tx(seed));
        }
        let batch = pool.take_batch(2);
        pool.requeue_front(batch);
        assert_eq!(
            pool.take_batch(4),
            vec![test_tx(0), test_tx(1), test_tx(2), test_tx(3)]
        );
    }

    #[test]
    fn capacity_is_enforced() {
        let mut pool = MempoolState::new(2);
        pool.on_transaction_submitted(test_tx(0));
        pool.on_transaction_submitted(test_tx(1));
        pool.on_transaction_submitted(test_tx(2));
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.dropped(), 1);
    }
}
