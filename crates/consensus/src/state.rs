//! The ordering state machine.
//!
//! `OrderingState` owns the poset and everything that feeds it: unit
//! admission (verification, orphan buffering, compliance, insertion),
//! unit creation, sync scheduling and the election driving the linear
//! order. It runs inside the arbiter loop and is the only code that
//! mutates the poset.

use crate::election::{Election, ElectionParams};
use crate::order::Extender;
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use totem_core::{Action, Event, OutboundMessage, SubStateMachine, TimerId};
use totem_dag::{
    select_parents, AdaptiveDelay, ComplianceParams, OrphanBuffer, Poset, PrepareError,
};
use totem_messages::{PosetSummary, SummaryEntry, UnitAnnouncement};
use totem_types::{
    Committee, DealtCoin, GossipStrategy, Hash, KeyPair, NodeConfig, OrderedBatch, OrderedUnit,
    ProcessId, Transaction, Unit, UnitDraft,
};

/// The sub-state machine owning the poset and the linear order.
pub struct OrderingState {
    pid: ProcessId,
    keypair: KeyPair,
    committee: Arc<Committee>,
    config: NodeConfig,
    poset: Poset,
    election: Election,
    extender: Extender,
    orphans: OrphanBuffer,
    create_delay: AdaptiveDelay,
    compliance: ComplianceParams,
    /// Hashes currently out for signature verification.
    pending_verification: HashSet<Hash>,
    rng: ChaCha8Rng,
    now: Duration,
}

impl std::fmt::Debug for OrderingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderingState")
            .field("pid", &self.pid.0)
            .field("units", &self.poset.len())
            .field("level_reached", &self.poset.level_reached())
            .field("timing_levels", &self.election.next_timing_level())
            .field("ordered", &self.extender.len())
            .field("orphans", &self.orphans.len())
            .finish()
    }
}

impl OrderingState {
    /// Create the ordering state for one process.
    ///
    /// `seed` feeds the process-local randomness (gossip peer choice,
    /// coin dealing); give each process a distinct seed.
    pub fn new(
        pid: ProcessId,
        keypair: KeyPair,
        committee: Arc<Committee>,
        config: NodeConfig,
        seed: u64,
    ) -> Self {
        let params = ElectionParams::from(&config);
        let compliance = ComplianceParams {
            add_shares: config.add_shares,
        };
        let mut seed_bytes = [0u8; 32];
        seed_bytes[..8].copy_from_slice(&seed.to_le_bytes());
        seed_bytes[8..10].copy_from_slice(&pid.0.to_le_bytes());
        Self {
            pid,
            keypair,
            committee: committee.clone(),
            poset: Poset::new(committee.size()),
            election: Election::new(pid, committee, params),
            extender: Extender::new(),
            orphans: OrphanBuffer::new(config.orphan_capacity, config.orphan_ttl),
            create_delay: AdaptiveDelay::new(&config),
            compliance,
            config,
            pending_verification: HashSet::new(),
            rng: ChaCha8Rng::from_seed(seed_bytes),
            now: Duration::ZERO,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Read access (for the node, runners and sync sessions)
    // ═══════════════════════════════════════════════════════════════════════

    /// The poset.
    pub fn poset(&self) -> &Poset {
        &self.poset
    }

    /// Units with a final position in the linear order.
    pub fn ordered_len(&self) -> usize {
        self.extender.len()
    }

    /// Levels with a decided timing unit.
    pub fn timing_levels(&self) -> u64 {
        self.election.next_timing_level()
    }

    /// This process's poset summary: one tip per committee member.
    pub fn summary(&self) -> PosetSummary {
        let entries = self
            .committee
            .processes()
            .map(|pid| {
                self.poset
                    .max_tip(pid)
                    .map(|(height, hash)| SummaryEntry { height, hash })
            })
            .collect();
        PosetSummary::new(entries)
    }

    /// The units a peer with `their` summary is missing, in topological
    /// order, ready to ship.
    pub fn units_to_send(&self, their: &PosetSummary) -> Vec<Unit> {
        let mut ids = Vec::new();
        for (pid, tip) in their.iter() {
            if !self.committee.contains(pid) {
                break;
            }
            let Some((our_height, _)) = self.poset.max_tip(pid) else {
                continue;
            };
            let their_height = tip.map(|t| t.height);
            if their_height.map_or(true, |h| our_height > h) {
                ids.extend(
                    self.poset
                        .units_by_creator_in_range(pid, their_height, our_height),
                );
            }
        }
        self.poset
            .topological_sort(&ids)
            .into_iter()
            .map(|id| self.poset.unit(id).clone())
            .collect()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Bootstrap
    // ═══════════════════════════════════════════════════════════════════════

    /// Create and announce the dealing unit, and arm all timers.
    pub fn bootstrap(&mut self) -> Vec<Action> {
        let coin = DealtCoin::deal(self.committee.size(), &mut self.rng);
        let unit = UnitDraft {
            creator: self.pid,
            height: 0,
            parents: vec![],
            txs: vec![],
            coin_payload: coin.encode(),
        }
        .sign(&self.keypair);

        let mut actions = self.admit_own(unit);
        actions.push(Action::SetTimer {
            id: TimerId::Create,
            duration: self.create_delay.current(),
        });
        actions.push(Action::SetTimer {
            id: TimerId::Sync,
            duration: self.config.sync_delay,
        });
        actions.push(Action::SetTimer {
            id: TimerId::Cleanup,
            duration: self.config.orphan_ttl,
        });
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Timer handlers
    // ═══════════════════════════════════════════════════════════════════════

    /// Attempt to create a unit carrying `txs`.
    ///
    /// Declines silently when no parents beyond the predecessor
    /// qualify; the transactions stay with the caller's queue in that
    /// case. Always re-arms the creation timer with the adapted delay.
    pub fn on_create_timer(&mut self, txs: Vec<Transaction>) -> (Vec<Action>, bool) {
        let mut actions = Vec::new();
        let mut created = false;

        if let Some(parents) = select_parents(&self.poset, self.pid, self.config.max_parents) {
            let (floor, level, prime) = self.poset.prepare_parts(&parents);
            let coin_payload = if prime && level >= self.config.add_shares {
                match self.election.create_coin_share(&self.poset, &floor, level) {
                    Some(share) => share.encode(),
                    None => Vec::new(),
                }
            } else {
                Vec::new()
            };
            let unit = UnitDraft {
                creator: self.pid,
                height: self.poset.height(parents[0]) + 1,
                parents: parents.iter().map(|&p| self.poset.hash(p)).collect(),
                txs,
                coin_payload,
            }
            .sign(&self.keypair);

            tracing::debug!(
                height = unit.height(),
                level,
                parents = unit.parents().len(),
                txs = unit.txs().len(),
                "created unit"
            );
            self.create_delay.record_level(level);
            actions.extend(self.admit_own(unit));
            created = true;
        } else {
            tracing::trace!("creation declined, no eligible parents");
        }

        actions.push(Action::SetTimer {
            id: TimerId::Create,
            duration: self.create_delay.current(),
        });
        (actions, created)
    }

    /// Pick a gossip peer and ask the runner to sync with it.
    pub fn on_sync_timer(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if let Some(peer) = self.pick_peer() {
            actions.push(Action::StartSync { peer });
        }
        actions.push(Action::SetTimer {
            id: TimerId::Sync,
            duration: self.config.sync_delay,
        });
        actions
    }

    fn pick_peer(&mut self) -> Option<ProcessId> {
        let n = self.committee.size() as u16;
        if n < 2 {
            return None;
        }
        match self.config.gossip_strategy {
            GossipStrategy::UniformRandom => {
                let pick = self.rng.gen_range(0..n - 1);
                let peer = if pick >= self.pid.0 { pick + 1 } else { pick };
                Some(ProcessId(peer))
            }
        }
    }

    /// Sweep expired orphans and re-arm the cleanup timer.
    pub fn on_cleanup_timer(&mut self) -> Vec<Action> {
        let expired = self.orphans.sweep(self.now);
        if expired > 0 {
            tracing::debug!(expired, "dropped expired orphans");
        }
        vec![Action::SetTimer {
            id: TimerId::Cleanup,
            duration: self.config.orphan_ttl,
        }]
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Unit admission
    // ═══════════════════════════════════════════════════════════════════════

    /// A unit arrived from the network; route it to signature
    /// verification unless it is already known.
    pub fn on_unit_received(&mut self, unit: Unit, source: Option<ProcessId>) -> Vec<Action> {
        let hash = unit.hash();
        if self.poset.contains(&hash)
            || self.orphans.contains(&hash)
            || self.pending_verification.contains(&hash)
        {
            // Replay: the unit is already known in some stage.
            return Vec::new();
        }
        let Some(public_key) = self.committee.public_key(unit.creator()).cloned() else {
            tracing::warn!(creator = unit.creator().0, "unit from unknown creator");
            return self.misbehavior(source, "unit creator outside committee");
        };
        self.pending_verification.insert(hash);
        vec![Action::VerifyUnitSignature {
            unit: Box::new(unit),
            source,
            public_key,
        }]
    }

    /// Signature verification came back; drop or admit the unit.
    pub fn on_unit_verified(
        &mut self,
        unit: Unit,
        source: Option<ProcessId>,
        valid: bool,
    ) -> Vec<Action> {
        self.pending_verification.remove(&unit.hash());
        if !valid {
            // Could be transport corruption; drop the unit and the
            // session, but never mark the creator a forker for this.
            tracing::warn!(unit = ?unit.hash(), "invalid unit signature");
            return self.misbehavior(source, "invalid unit signature");
        }
        self.admit(unit, source)
    }

    /// Insert a verified unit, or buffer it while parents are missing.
    /// Inserting may release orphans and decide timing levels.
    fn admit(&mut self, unit: Unit, source: Option<ProcessId>) -> Vec<Action> {
        let mut actions = Vec::new();
        let mut queue = vec![(unit, source)];
        while let Some((unit, source)) = queue.pop() {
            let hash = unit.hash();
            let missing = self.poset.missing_parents(&unit);
            if !missing.is_empty() {
                self.orphans.insert(unit, source, missing, self.now);
                continue;
            }
            match self.poset.prepare(unit) {
                Err(PrepareError::Duplicate) => continue,
                Err(PrepareError::CreatorOutOfRange(_)) => {
                    actions.extend(self.misbehavior(source, "unit creator outside committee"));
                }
                Err(PrepareError::MissingParents(_)) => continue,
                Ok(candidate) => {
                    if let Err(violation) = self.poset.check_compliance(&candidate, &self.compliance)
                    {
                        tracing::warn!(unit = ?hash, %violation, "non-compliant unit rejected");
                        actions.extend(self.misbehavior(source, "non-compliant unit"));
                        continue;
                    }
                    let id = self.poset.insert(candidate);
                    actions.extend(self.post_insert(id));
                    for released in self.orphans.on_unit_added(&hash) {
                        queue.push(released);
                    }
                }
            }
        }
        actions
    }

    /// Post-insert bookkeeping: register dealt coins, try timing
    /// decisions, extend the linear order.
    fn post_insert(&mut self, id: totem_dag::UnitId) -> Vec<Action> {
        if self.poset.unit(id).is_dealing() {
            self.election.register_dealing_unit(&self.poset, id);
        }
        let mut actions = Vec::new();
        for timing in self.election.attempt(&self.poset) {
            let round = self.poset.level(timing);
            let units: Vec<OrderedUnit> = self
                .extender
                .extend(&self.poset, timing)
                .into_iter()
                .map(|unit| OrderedUnit {
                    hash: self.poset.hash(unit),
                    creator: self.poset.creator(unit),
                    round,
                    txs: self.poset.unit(unit).txs().to_vec(),
                })
                .collect();
            tracing::info!(
                round,
                units = units.len(),
                total_ordered = self.extender.len(),
                "linear order extended"
            );
            actions.push(Action::EmitOrderedBatch {
                batch: OrderedBatch { round, units },
            });
        }
        actions
    }

    /// Admit a unit we created ourselves; any failure is fatal.
    fn admit_own(&mut self, unit: Unit) -> Vec<Action> {
        let hash = unit.hash();
        let announcement = UnitAnnouncement::new(unit.clone());
        match self.poset.prepare(unit) {
            Ok(candidate) => {
                if let Err(violation) = self.poset.check_compliance(&candidate, &self.compliance) {
                    tracing::error!(unit = ?hash, %violation, "own unit failed self-checks");
                    return vec![Action::Shutdown {
                        reason: format!("own unit failed self-checks: {violation}"),
                    }];
                }
                let id = self.poset.insert(candidate);
                let mut actions = self.post_insert(id);
                actions.push(Action::Broadcast {
                    message: OutboundMessage::UnitAnnouncement(Box::new(announcement)),
                });
                actions
            }
            Err(error) => {
                tracing::error!(unit = ?hash, %error, "own unit failed preparation");
                vec![Action::Shutdown {
                    reason: format!("own unit failed preparation: {error}"),
                }]
            }
        }
    }

    fn misbehavior(&self, source: Option<ProcessId>, reason: &str) -> Vec<Action> {
        match source {
            Some(peer) => vec![Action::ReportMisbehavior {
                peer,
                reason: reason.to_string(),
            }],
            None => Vec::new(),
        }
    }
}

impl SubStateMachine for OrderingState {
    fn try_handle(&mut self, event: &Event) -> Option<Vec<Action>> {
        match event {
            Event::SyncTimer => Some(self.on_sync_timer()),
            Event::CleanupTimer => Some(self.on_cleanup_timer()),
            Event::UnitReceived { unit, source } => {
                Some(self.on_unit_received((**unit).clone(), *source))
            }
            Event::UnitSignatureVerified {
                unit,
                source,
                valid,
            } => Some(self.on_unit_verified((**unit).clone(), *source, *valid)),
            // CreateTimer needs the mempool's transactions; the node
            // routes it explicitly.
            _ => None,
        }
    }

    fn set_time(&mut self, now: Duration) {
        self.now = now;
    }
}
