//! Node state machine.

use std::sync::Arc;
use std::time::Duration;
use totem_consensus::OrderingState;
use totem_core::{Action, Event, StateMachine, SubStateMachine};
use totem_mempool::MempoolState;
use totem_types::{Committee, KeyPair, NodeConfig, ProcessId};

/// Combined node state machine.
///
/// Composes the ordering engine and the mempool into a single state
/// machine driven by the arbiter loop.
pub struct NodeStateMachine {
    pid: ProcessId,
    txs_per_unit: usize,
    ordering: OrderingState,
    mempool: MempoolState,
    now: Duration,
}

impl std::fmt::Debug for NodeStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeStateMachine")
            .field("pid", &self.pid.0)
            .field("ordering", &self.ordering)
            .field("mempool", &self.mempool.len())
            .field("now", &self.now)
            .finish()
    }
}

impl NodeStateMachine {
    /// Create a node state machine for one committee member.
    ///
    /// `seed` feeds the process-local randomness; give each process a
    /// distinct value.
    pub fn new(
        pid: ProcessId,
        keypair: KeyPair,
        committee: Arc<Committee>,
        config: NodeConfig,
        seed: u64,
    ) -> Self {
        Self {
            pid,
            txs_per_unit: config.txs_per_unit,
            mempool: MempoolState::new(config.mempool_capacity),
            ordering: OrderingState::new(pid, keypair, committee, config, seed),
            now: Duration::ZERO,
        }
    }

    /// This process's id.
    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    /// The ordering engine (poset, timing, linear order).
    pub fn ordering(&self) -> &OrderingState {
        &self.ordering
    }

    /// The transaction queue.
    pub fn mempool(&self) -> &MempoolState {
        &self.mempool
    }

    /// Create the dealing unit and arm the timers.
    ///
    /// Returns actions to be processed (announcement, initial timers).
    pub fn bootstrap(&mut self) -> Vec<Action> {
        self.ordering.bootstrap()
    }

    /// Creation needs the mempool's transactions, so the node gathers
    /// them before delegating; a declined attempt hands them back.
    fn on_create_timer(&mut self) -> Vec<Action> {
        let txs = self.mempool.take_batch(self.txs_per_unit);
        let (actions, created) = self.ordering.on_create_timer(txs.clone());
        if !created && !txs.is_empty() {
            self.mempool.requeue_front(txs);
        }
        actions
    }
}

impl StateMachine for NodeStateMachine {
    fn handle(&mut self, event: Event) -> Vec<Action> {
        match &event {
            Event::CreateTimer => return self.on_create_timer(),

            Event::TransactionSubmitted { .. } => {
                if let Some(actions) = self.mempool.try_handle(&event) {
                    return actions;
                }
            }

            _ => {
                if let Some(actions) = self.ordering.try_handle(&event) {
                    return actions;
                }
            }
        }
        tracing::warn!(event = event.type_name(), "unhandled event");
        Vec::new()
    }

    fn set_time(&mut self, now: Duration) {
        self.now = now;
        self.ordering.set_time(now);
        self.mempool.set_time(now);
    }

    fn now(&self) -> Duration {
        self.now
    }
}
