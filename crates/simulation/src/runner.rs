//! Deterministic simulation runner.
//!
//! Drives a whole committee inside one process. Events live in a
//! global `BTreeMap` keyed by [`EventKey`]; delegated work (signature
//! verification) executes inline; sync sessions are resolved directly
//! against peer posets with sampled latency. Given the same seed, a
//! run produces identical posets, timing decisions and linear orders
//! every time.

use crate::event_queue::EventKey;
use crate::network::{NetworkConfig, SimulatedNetwork};
use crate::NodeIndex;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use totem_core::{Action, Event, OutboundMessage, StateMachine, TimerId};
use totem_node::NodeStateMachine;
use totem_types::{
    Committee, KeyPair, NodeConfig, OrderedBatch, ProcessId, Transaction, Unit,
};
use tracing::{debug, info, trace, warn};

/// Statistics collected during simulation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SimulationStats {
    /// Total events processed.
    pub events_processed: u64,
    /// Events processed by priority class.
    pub events_by_priority: [u64; 4],
    /// Total actions generated.
    pub actions_generated: u64,
    /// Unit deliveries scheduled (announcements and sync transfers).
    pub units_delivered: u64,
    /// Deliveries dropped due to a partition.
    pub dropped_partition: u64,
    /// Deliveries dropped due to packet loss.
    pub dropped_loss: u64,
    /// Sync sessions resolved.
    pub syncs_completed: u64,
    /// Timers set.
    pub timers_set: u64,
    /// Timers cancelled.
    pub timers_cancelled: u64,
    /// Misbehavior reports emitted by nodes.
    pub misbehavior_reports: u64,
}

/// Deterministic simulation runner.
pub struct SimulationRunner {
    committee: Arc<Committee>,
    keys: Vec<KeyPair>,
    nodes: Vec<NodeStateMachine>,
    /// Nodes that were shut down or never started.
    halted: Vec<bool>,
    event_queue: BTreeMap<EventKey, Event>,
    sequence: u64,
    now: Duration,
    network: SimulatedNetwork,
    rng: ChaCha8Rng,
    /// (node, timer) -> queued firing, for cancellation and re-arming.
    timers: HashMap<(NodeIndex, TimerId), EventKey>,
    /// Per-node ordered output, as emitted.
    orders: Vec<Vec<OrderedBatch>>,
    stats: SimulationStats,
}

impl SimulationRunner {
    /// Build a committee of `n` nodes with deterministic keys.
    pub fn new(n: usize, node_config: NodeConfig, network_config: NetworkConfig, seed: u64) -> Self {
        let keys: Vec<KeyPair> = (0..n)
            .map(|i| {
                let mut seed_bytes = [0u8; 32];
                let key_seed = seed
                    .wrapping_add(i as u64)
                    .wrapping_mul(0x517c_c1b7_2722_0a95);
                seed_bytes[..8].copy_from_slice(&key_seed.to_le_bytes());
                seed_bytes[8..16].copy_from_slice(&(i as u64).to_le_bytes());
                KeyPair::from_seed(&seed_bytes)
            })
            .collect();
        let committee = Arc::new(Committee::new(keys.iter().map(|k| k.public_key()).collect()));

        let nodes: Vec<NodeStateMachine> = (0..n)
            .map(|i| {
                NodeStateMachine::new(
                    ProcessId(i as u16),
                    keys[i].clone(),
                    committee.clone(),
                    node_config.clone(),
                    seed.wrapping_add(i as u64),
                )
            })
            .collect();

        info!(nodes = n, seed, "created simulation runner");
        Self {
            committee,
            keys,
            halted: vec![false; n],
            nodes,
            event_queue: BTreeMap::new(),
            sequence: 0,
            now: Duration::ZERO,
            network: SimulatedNetwork::new(network_config),
            rng: ChaCha8Rng::seed_from_u64(seed),
            timers: HashMap::new(),
            orders: vec![Vec::new(); n],
            stats: SimulationStats::default(),
        }
    }

    /// Bootstrap every node at the current time.
    pub fn start(&mut self) {
        for node in 0..self.nodes.len() {
            self.start_node(node as NodeIndex);
        }
    }

    /// Bootstrap a single node; late joiners call this mid-run.
    pub fn start_node(&mut self, node: NodeIndex) {
        self.halted[node as usize] = false;
        self.nodes[node as usize].set_time(self.now);
        let actions = self.nodes[node as usize].bootstrap();
        for action in actions {
            self.process_action(node, action);
        }
    }

    /// Mark a node as absent: its events are discarded from now on.
    pub fn halt_node(&mut self, node: NodeIndex) {
        self.halted[node as usize] = true;
    }

    /// Queue a client transaction at the current time.
    pub fn submit_transaction(&mut self, node: NodeIndex, tx: Transaction) {
        self.schedule_event(node, self.now, Event::TransactionSubmitted { tx });
    }

    /// Deliver a raw unit to one node, as a sync peer would.
    pub fn inject_unit(&mut self, node: NodeIndex, unit: Unit, source: ProcessId) {
        self.schedule_event(
            node,
            self.now,
            Event::UnitReceived {
                unit: Box::new(unit),
                source: Some(source),
            },
        );
    }

    /// Run until the queue drains or `end_time` is reached.
    pub fn run_until(&mut self, end_time: Duration) {
        while let Some((&key, _)) = self.event_queue.first_key_value() {
            if key.time > end_time {
                break;
            }
            let Some((key, event)) = self.event_queue.pop_first() else {
                break;
            };
            self.now = key.time;
            let node = key.node;

            if self.halted[node as usize] {
                continue;
            }

            self.stats.events_processed += 1;
            self.stats.events_by_priority[event.priority() as usize] += 1;
            trace!(time = ?self.now, node, event = event.type_name(), "processing event");

            let machine = &mut self.nodes[node as usize];
            machine.set_time(self.now);
            let actions = machine.handle(event);
            self.stats.actions_generated += actions.len() as u64;

            for action in actions {
                self.process_action(node, action);
            }
        }
        self.now = end_time.max(self.now);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════

    /// Current simulation time.
    pub fn now(&self) -> Duration {
        self.now
    }

    /// Statistics so far.
    pub fn stats(&self) -> &SimulationStats {
        &self.stats
    }

    /// The shared committee description.
    pub fn committee(&self) -> &Arc<Committee> {
        &self.committee
    }

    /// A node's signing key (tests craft adversarial units with it).
    pub fn key(&self, node: NodeIndex) -> &KeyPair {
        &self.keys[node as usize]
    }

    /// A node's state machine.
    pub fn node(&self, node: NodeIndex) -> &NodeStateMachine {
        &self.nodes[node as usize]
    }

    /// The ordered batches a node has emitted.
    pub fn orders(&self, node: NodeIndex) -> &[OrderedBatch] {
        &self.orders[node as usize]
    }

    /// A node's linear order flattened to unit hashes.
    pub fn ordered_hashes(&self, node: NodeIndex) -> Vec<totem_types::Hash> {
        self.orders[node as usize]
            .iter()
            .flat_map(|batch| batch.units.iter().map(|unit| unit.hash))
            .collect()
    }

    /// Mutable access to the network for partitions and healing.
    pub fn network_mut(&mut self) -> &mut SimulatedNetwork {
        &mut self.network
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Action execution
    // ═══════════════════════════════════════════════════════════════════════

    fn process_action(&mut self, from: NodeIndex, action: Action) {
        match action {
            Action::Broadcast { message } => {
                let OutboundMessage::UnitAnnouncement(announcement) = message;
                let unit = announcement.into_unit();
                for to in 0..self.nodes.len() as NodeIndex {
                    if to != from {
                        self.try_deliver_unit(from, to, unit.clone());
                    }
                }
            }

            Action::StartSync { peer } => {
                self.resolve_sync(from, peer.0);
            }

            Action::SetTimer { id, duration } => {
                if let Some(old) = self.timers.remove(&(from, id)) {
                    self.event_queue.remove(&old);
                }
                let event = timer_event(id);
                let key = self.schedule_event(from, self.now + duration, event);
                self.timers.insert((from, id), key);
                self.stats.timers_set += 1;
            }

            Action::CancelTimer { id } => {
                if let Some(key) = self.timers.remove(&(from, id)) {
                    self.event_queue.remove(&key);
                    self.stats.timers_cancelled += 1;
                }
            }

            Action::EnqueueInternal { event } => {
                self.schedule_event(from, self.now, event);
            }

            // Delegated work executes instantly in simulation.
            Action::VerifyUnitSignature {
                unit,
                source,
                public_key,
            } => {
                let valid = unit.verify_signature(&public_key);
                self.schedule_event(
                    from,
                    self.now,
                    Event::UnitSignatureVerified {
                        unit,
                        source,
                        valid,
                    },
                );
            }

            Action::EmitOrderedBatch { batch } => {
                debug!(
                    node = from,
                    round = batch.round,
                    units = batch.units.len(),
                    "ordered batch emitted"
                );
                self.orders[from as usize].push(batch);
            }

            Action::ReportMisbehavior { peer, reason } => {
                warn!(node = from, peer = peer.0, %reason, "peer misbehavior reported");
                self.stats.misbehavior_reports += 1;
            }

            Action::Shutdown { reason } => {
                warn!(node = from, %reason, "node shut down");
                self.halted[from as usize] = true;
            }
        }
    }

    /// Resolve a pairwise sync directly against the peer's poset.
    ///
    /// Each side computes what the other is missing from the exchanged
    /// summaries; both batches travel one summary round-trip plus one
    /// transfer leg, so they arrive after two sampled latencies.
    fn resolve_sync(&mut self, initiator: NodeIndex, responder: NodeIndex) {
        if responder as usize >= self.nodes.len() || initiator == responder {
            return;
        }
        if self.halted[responder as usize] {
            return;
        }
        if self.network.is_partitioned(initiator, responder) {
            self.stats.dropped_partition += 1;
            trace!(initiator, responder, "sync dropped by partition");
            return;
        }

        let initiator_summary = self.nodes[initiator as usize].ordering().summary();
        let responder_summary = self.nodes[responder as usize].ordering().summary();
        let to_initiator = self.nodes[responder as usize]
            .ordering()
            .units_to_send(&initiator_summary);
        let to_responder = self.nodes[initiator as usize]
            .ordering()
            .units_to_send(&responder_summary);

        self.stats.syncs_completed += 1;
        self.deliver_batch(responder, initiator, to_initiator);
        self.deliver_batch(initiator, responder, to_responder);
    }

    fn deliver_batch(&mut self, from: NodeIndex, to: NodeIndex, units: Vec<Unit>) {
        if units.is_empty() {
            return;
        }
        if self.network.should_drop_packet(&mut self.rng) {
            self.stats.dropped_loss += 1;
            return;
        }
        let latency = self.network.sample_latency(&mut self.rng)
            + self.network.sample_latency(&mut self.rng);
        let arrival = self.now + latency;
        let source = Some(ProcessId(from));
        // Same arrival time for the batch: sequence numbers preserve
        // the sender's topological order.
        for unit in units {
            self.stats.units_delivered += 1;
            self.schedule_event(
                to,
                arrival,
                Event::UnitReceived {
                    unit: Box::new(unit),
                    source,
                },
            );
        }
    }

    fn try_deliver_unit(&mut self, from: NodeIndex, to: NodeIndex, unit: Unit) {
        if self.network.is_partitioned(from, to) {
            self.stats.dropped_partition += 1;
            return;
        }
        if self.network.should_drop_packet(&mut self.rng) {
            self.stats.dropped_loss += 1;
            return;
        }
        let latency = self.network.sample_latency(&mut self.rng);
        self.stats.units_delivered += 1;
        self.schedule_event(
            to,
            self.now + latency,
            Event::UnitReceived {
                unit: Box::new(unit),
                source: Some(ProcessId(from)),
            },
        );
    }

    fn schedule_event(&mut self, node: NodeIndex, time: Duration, event: Event) -> EventKey {
        self.sequence += 1;
        let key = EventKey::new(time, &event, node, self.sequence);
        self.event_queue.insert(key, event);
        key
    }
}

fn timer_event(id: TimerId) -> Event {
    match id {
        TimerId::Create => Event::CreateTimer,
        TimerId::Sync => Event::SyncTimer,
        TimerId::Cleanup => Event::CleanupTimer,
    }
}
