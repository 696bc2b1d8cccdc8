//! Timing-unit election.
//!
//! For each level the committee elects one prime unit as the *timing
//! unit*. Candidates are tried in the common-random-permutation order;
//! for each candidate the decision runs through three phases:
//!
//! 1. **Fast**: any prime unit two or more levels up that *proves the
//!    candidate popular* (its lower cone reaches the candidate through a
//!    supermajority of creators) decides 1 immediately.
//! 2. **Voting**: prime units vote level by level; a vote that is the
//!    supermajority of the votes below, and agrees with the level's
//!    default vote, decides.
//! 3. **Pi-delta**: alternating supermajority and exists rounds, the
//!    latter drawing on the threshold coin, guarantee termination with
//!    probability 1.
//!
//! All partial results are memoized per candidate and dropped wholesale
//! once the candidate's level is decided.

use crate::crp;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use totem_dag::{Poset, UnitId};
use totem_types::{CoinShare, Committee, Hash, NodeConfig, ProcessId, ThresholdCoin};

/// Election tuning, lifted from the node configuration.
#[derive(Debug, Clone, Copy)]
pub struct ElectionParams {
    /// First voting level offset (`t` in the fast algorithm).
    pub voting_level: u64,
    /// Offset at which the pi-delta protocol takes over.
    pub pi_delta_level: u64,
    /// Level from which prime units carry coin shares.
    pub add_shares: u64,
}

impl From<&NodeConfig> for ElectionParams {
    fn from(config: &NodeConfig) -> Self {
        Self {
            voting_level: config.voting_level,
            pi_delta_level: config.pi_delta_level,
            add_shares: config.add_shares,
        }
    }
}

#[derive(Default)]
struct CandidateMemo {
    decision: Option<bool>,
    /// prover hash -> does it prove the candidate popular
    proof: HashMap<Hash, bool>,
    /// voter hash -> vote (None is "bot")
    vote: HashMap<Hash, Option<bool>>,
    pi: HashMap<Hash, Option<bool>>,
    delta: HashMap<Hash, Option<bool>>,
}

/// The per-process election state.
pub struct Election {
    owner: ProcessId,
    committee: Arc<Committee>,
    params: ElectionParams,
    /// timing_units[k] is the decided timing unit of level k.
    timing_units: Vec<UnitId>,
    memos: HashMap<Hash, CandidateMemo>,
    /// Threshold coins extracted from dealing units, by dealing hash.
    threshold_coins: HashMap<Hash, ThresholdCoin>,
}

impl Election {
    /// A fresh election state for `owner`.
    pub fn new(owner: ProcessId, committee: Arc<Committee>, params: ElectionParams) -> Self {
        Self {
            owner,
            committee,
            params,
            timing_units: Vec::new(),
            memos: HashMap::new(),
            threshold_coins: HashMap::new(),
        }
    }

    /// Decided timing units so far, level 0 first.
    pub fn timing_units(&self) -> &[UnitId] {
        &self.timing_units
    }

    /// The next level awaiting a timing decision.
    pub fn next_timing_level(&self) -> u64 {
        self.timing_units.len() as u64
    }

    /// Extract and store the threshold coin dealt by a dealing unit.
    ///
    /// Compliance already vetted the payload shape; a second dealing
    /// unit by the same process simply registers a second coin.
    pub fn register_dealing_unit(&mut self, poset: &Poset, id: UnitId) {
        let unit = poset.unit(id);
        let Ok(dealt) = unit.dealt_coin(self.committee.size()) else {
            return;
        };
        self.threshold_coins.insert(
            unit.hash(),
            ThresholdCoin::new(
                unit.creator(),
                self.owner,
                self.committee.coin_threshold(),
                dealt,
            ),
        );
    }

    /// The coin share an own prime unit at `level` must carry, created
    /// from the first dealing unit below the unit under construction.
    pub fn create_coin_share(
        &self,
        poset: &Poset,
        floor: &[Vec<UnitId>],
        level: u64,
    ) -> Option<CoinShare> {
        for dealer in crp::dealer_order(self.committee.size(), level) {
            if floor[dealer.index()].len() > 1 {
                continue;
            }
            for &dealing in poset.dealing_units(dealer) {
                if poset.below_floor(dealing, floor) {
                    return self
                        .threshold_coins
                        .get(&poset.hash(dealing))
                        .map(|coin| coin.create_share(level));
                }
            }
        }
        None
    }

    /// Try to decide timing units for levels that still lack one.
    ///
    /// Returns the newly decided timing units, lower levels first. The
    /// loop stops at the first undecidable level; higher levels cannot
    /// be decided out of order.
    pub fn attempt(&mut self, poset: &Poset) -> Vec<UnitId> {
        let mut decided = Vec::new();
        loop {
            let level = self.next_timing_level();
            match self.decide_level(poset, level) {
                Some(unit) => {
                    // The memoized partial results for this level's
                    // candidates are dead weight from here on.
                    for prime in poset.primes_at(level) {
                        self.memos.remove(&poset.hash(prime));
                    }
                    self.timing_units.push(unit);
                    tracing::info!(
                        level,
                        unit = ?poset.hash(unit),
                        creator = poset.creator(unit).0,
                        "timing unit decided"
                    );
                    decided.push(unit);
                }
                None => break,
            }
        }
        decided
    }

    /// Decide which prime unit of `level` is the timing unit, or `None`
    /// if the poset cannot tell yet.
    fn decide_level(&mut self, poset: &Poset, level: u64) -> Option<UnitId> {
        // Below this horizon an unseen candidate could still win.
        if poset.level_reached() < level + self.params.voting_level {
            return None;
        }
        let prev_timing = level
            .checked_sub(1)
            .and_then(|prev| self.timing_units.get(prev as usize))
            .map(|&id| poset.hash(id));

        for pid in crp::candidate_order(self.committee.size(), level, prev_timing) {
            // Fork duplicates are iterated in hash order by every process.
            for &candidate in poset.primes_of(level, pid) {
                match self.decide_candidate(poset, candidate) {
                    Some(true) => return Some(candidate),
                    Some(false) => continue,
                    None => return None,
                }
            }
        }
        // Unreachable for a compliant poset: some candidate must decide 1.
        tracing::error!(level, "no timing-unit candidate decided positively");
        None
    }

    /// Decide the popularity of one candidate: `Some(true)` elects it,
    /// `Some(false)` skips it, `None` means not decidable yet.
    fn decide_candidate(&mut self, poset: &Poset, candidate: UnitId) -> Option<bool> {
        let candidate_hash = poset.hash(candidate);
        if let Some(decision) = self
            .memos
            .get(&candidate_hash)
            .and_then(|memo| memo.decision)
        {
            return Some(decision);
        }

        let candidate_level = poset.level(candidate);
        let t = self.params.voting_level;
        let t_p_d = self.params.pi_delta_level;

        // Fast path: a popularity proof at a low level settles it.
        for level in candidate_level + 2..candidate_level + t {
            for prover in poset.primes_at(level) {
                if self.proves_popularity(poset, prover, candidate) {
                    self.record_decision(poset, candidate_hash, candidate_level, level, true, "fast");
                    return Some(true);
                }
            }
        }

        // Voting path: a supermajority vote agreeing with the default
        // vote is final.
        let voting_end = (candidate_level + t_p_d).min(poset.level_reached() + 1);
        for level in candidate_level + t + 1..voting_end {
            for voter in poset.primes_at(level) {
                let vote = self.compute_vote(poset, voter, candidate);
                let default = self.default_vote(poset.level(voter), candidate_level, candidate_hash);
                if vote == Some(default) {
                    self.record_decision(poset, candidate_hash, candidate_level, level, default, "vote");
                    return Some(default);
                }
            }
        }

        // Pi-delta path: delta is evaluated on every second level.
        let mut level = candidate_level + t_p_d + 1;
        while level <= poset.level_reached() {
            for unit in poset.primes_at(level) {
                if let Some(decision) = self.compute_delta(poset, candidate, unit) {
                    self.record_decision(poset, candidate_hash, candidate_level, level, decision, "pi-delta");
                    return Some(decision);
                }
            }
            level += 2;
        }

        None
    }

    fn record_decision(
        &mut self,
        poset: &Poset,
        candidate_hash: Hash,
        candidate_level: u64,
        decided_at: u64,
        decision: bool,
        path: &'static str,
    ) {
        self.memos.entry(candidate_hash).or_default().decision = Some(decision);
        tracing::debug!(
            candidate = ?candidate_hash,
            level = candidate_level,
            decided_after = decided_at - candidate_level,
            poset_after = poset.level_reached() - candidate_level,
            decision,
            path,
            "candidate decided"
        );
    }

    /// Does `prover` prove the candidate popular on its level?
    ///
    /// True iff a walk down from `prover` reaches the candidate through
    /// units of a supermajority of distinct creators, counting only
    /// units at least two levels down or prime units one level down.
    fn proves_popularity(&mut self, poset: &Poset, prover: UnitId, candidate: UnitId) -> bool {
        let candidate_hash = poset.hash(candidate);
        let prover_hash = poset.hash(prover);
        if let Some(&known) = self
            .memos
            .get(&candidate_hash)
            .and_then(|memo| memo.proof.get(&prover_hash))
        {
            return known;
        }

        let prover_level = poset.level(prover);
        let result = if prover_level <= poset.level(candidate) || !poset.below(candidate, prover) {
            false
        } else {
            let mut seen_units: HashSet<UnitId> = HashSet::from([prover]);
            let mut seen_creators: HashSet<ProcessId> = HashSet::new();
            let mut queue: VecDeque<UnitId> = VecDeque::from([prover]);
            // Every queued unit is above the candidate; the walk stays
            // inside the band between the two levels.
            while let Some(unit) = queue.pop_front() {
                if self.committee.is_quorum(seen_creators.len()) {
                    break;
                }
                let level = poset.level(unit);
                if level + 2 <= prover_level || (level + 1 == prover_level && poset.is_prime(unit))
                {
                    seen_creators.insert(poset.creator(unit));
                }
                for &parent in poset.parents(unit) {
                    if !seen_units.contains(&parent) && poset.below(candidate, parent) {
                        seen_units.insert(parent);
                        queue.push_back(parent);
                    }
                }
            }
            self.committee.is_quorum(seen_creators.len())
        };

        self.memos
            .entry(candidate_hash)
            .or_default()
            .proof
            .insert(prover_hash, result);
        result
    }

    /// The vote of `voter` on the candidate's popularity; `None` is bot.
    ///
    /// At the first voting level the vote is the popularity proof; above
    /// it, the supermajority of the votes of the prime units one level
    /// down inside the voter's cone, with bot votes replaced by the
    /// default vote.
    fn compute_vote(&mut self, poset: &Poset, voter: UnitId, candidate: UnitId) -> Option<bool> {
        let candidate_hash = poset.hash(candidate);
        let voter_hash = poset.hash(voter);
        let candidate_level = poset.level(candidate);
        let voter_level = poset.level(voter);
        debug_assert!(voter_level >= candidate_level + self.params.voting_level);

        if let Some(&known) = self
            .memos
            .get(&candidate_hash)
            .and_then(|memo| memo.vote.get(&voter_hash))
        {
            return known;
        }

        let vote = if voter_level == candidate_level + self.params.voting_level {
            Some(self.proves_popularity(poset, voter, candidate))
        } else {
            let mut votes: Vec<Option<bool>> = Vec::new();
            for below in poset.primes_below(voter_level - 1, voter) {
                let vote = self
                    .compute_vote(poset, below, candidate)
                    .unwrap_or_else(|| {
                        self.default_vote(voter_level - 1, candidate_level, candidate_hash)
                    });
                votes.push(Some(vote));
            }
            self.super_majority(votes)
        };

        self.memos
            .entry(candidate_hash)
            .or_default()
            .vote
            .insert(voter_hash, vote);
        vote
    }

    /// The default vote of a prime unit at `voter_level`: 1 on the first
    /// round past the voting level, 0 on the second, then a
    /// deterministic bit of the candidate hash.
    fn default_vote(&self, voter_level: u64, candidate_level: u64, candidate_hash: Hash) -> bool {
        let round = voter_level - candidate_level - self.params.voting_level;
        debug_assert!(round >= 1, "default vote asked below the voting level");
        match round {
            1 => true,
            2 => false,
            _ => simple_coin(candidate_hash, voter_level),
        }
    }

    /// The pi value of `unit` for the candidate (pi-delta protocol).
    fn compute_pi(&mut self, poset: &Poset, candidate: UnitId, unit: UnitId) -> Option<bool> {
        let candidate_hash = poset.hash(candidate);
        let unit_hash = poset.hash(unit);
        let candidate_level = poset.level(candidate);
        let unit_level = poset.level(unit);
        // Round numbering starts at 1 on the first pi-delta level so
        // that an odd, supermajority round runs first.
        let round = unit_level + 1 - (candidate_level + self.params.pi_delta_level);
        debug_assert!(round >= 1);

        if let Some(&known) = self
            .memos
            .get(&candidate_hash)
            .and_then(|memo| memo.pi.get(&unit_hash))
        {
            return known;
        }

        let mut values: Vec<Option<bool>> = Vec::new();
        for below in poset.primes_below(unit_level - 1, unit) {
            if round == 1 {
                let vote = self
                    .compute_vote(poset, below, candidate)
                    .unwrap_or_else(|| {
                        self.default_vote(unit_level - 1, candidate_level, candidate_hash)
                    });
                values.push(Some(vote));
            } else {
                let pi = self.compute_pi(poset, candidate, below);
                values.push(pi);
            }
        }

        let result = if round % 2 == 0 {
            Some(self.exists_with_coin(poset, values, candidate, unit))
        } else {
            self.super_majority(values)
        };

        self.memos
            .entry(candidate_hash)
            .or_default()
            .pi
            .insert(unit_hash, result);
        result
    }

    /// The delta value of `unit` for the candidate; `Some` is a final
    /// decision.
    fn compute_delta(&mut self, poset: &Poset, candidate: UnitId, unit: UnitId) -> Option<bool> {
        let candidate_hash = poset.hash(candidate);
        let unit_hash = poset.hash(unit);
        let unit_level = poset.level(unit);
        debug_assert!(
            (unit_level + 1 - (poset.level(candidate) + self.params.pi_delta_level)) % 2 == 0,
            "delta evaluated on an odd round"
        );

        if let Some(&known) = self
            .memos
            .get(&candidate_hash)
            .and_then(|memo| memo.delta.get(&unit_hash))
        {
            return known;
        }

        let values: Vec<Option<bool>> = poset
            .primes_below(unit_level - 1, unit)
            .into_iter()
            .map(|below| self.compute_pi(poset, candidate, below))
            .collect();
        let result = self.super_majority(values);

        self.memos
            .entry(candidate_hash)
            .or_default()
            .delta
            .insert(unit_hash, result);
        result
    }

    /// The exists function: any definite value wins (1 preferred),
    /// otherwise the common coin tossed at `tossing`.
    fn exists_with_coin(
        &mut self,
        poset: &Poset,
        values: Vec<Option<bool>>,
        candidate: UnitId,
        tossing: UnitId,
    ) -> bool {
        if values.iter().any(|v| *v == Some(true)) {
            return true;
        }
        if values.iter().any(|v| *v == Some(false)) {
            return false;
        }
        self.toss_coin(poset, candidate, tossing)
    }

    /// Supermajority of definite values, `None` when neither side has
    /// a quorum.
    fn super_majority(&self, values: Vec<Option<bool>>) -> Option<bool> {
        let ones = values.iter().filter(|v| **v == Some(true)).count();
        let zeros = values.iter().filter(|v| **v == Some(false)).count();
        if self.committee.is_quorum(ones) {
            return Some(true);
        }
        if self.committee.is_quorum(zeros) {
            return Some(false);
        }
        None
    }

    /// Toss the common coin at `tossing`.
    ///
    /// Collects the coin shares carried by the prime units one level
    /// down inside the tossing unit's cone, validates them against the
    /// dealing unit the dealer order designates, and combines them.
    /// Any failure falls back to a deterministic bit; a failed toss
    /// only delays the decision, never breaks agreement on it.
    fn toss_coin(&mut self, poset: &Poset, candidate: UnitId, tossing: UnitId) -> bool {
        let tossing_level = poset.level(tossing);
        if self.params.add_shares >= tossing_level {
            return simple_coin(poset.hash(tossing), tossing_level);
        }
        let level = tossing_level - 1;

        let mut shares: BTreeMap<ProcessId, CoinShare> = BTreeMap::new();
        let mut dealing: Option<UnitId> = None;
        for carrier in poset.primes_at(level) {
            if shares.len() == self.committee.coin_threshold() {
                break;
            }
            if !poset.below(carrier, tossing) {
                continue;
            }
            let creator = poset.creator(carrier);
            // A forker must not contribute the same share twice.
            if shares.contains_key(&creator) {
                continue;
            }
            let Some(first_dealing) = self.first_dealing_unit(poset, carrier) else {
                continue;
            };
            let chosen = *dealing.get_or_insert(first_dealing);
            if chosen != first_dealing {
                // Two carriers disagree on the dealer; keep collecting
                // shares for the first choice and hope for a threshold.
                continue;
            }
            let Ok(share) = poset.unit(carrier).coin_share() else {
                continue;
            };
            let Some(coin) = self.threshold_coins.get(&poset.hash(chosen)) else {
                continue;
            };
            if coin.verify_share(&share, creator, poset.level(carrier)) {
                shares.insert(creator, share);
            }
        }

        if shares.len() == self.committee.coin_threshold() {
            let coin = dealing.and_then(|d| self.threshold_coins.get(&poset.hash(d)));
            if let Some(coin) = coin {
                let (bit, ok) = coin.combine_shares(&shares, level);
                if ok {
                    tracing::debug!(level = tossing_level, shares = shares.len(), "coin toss combined");
                    return bit;
                }
                tracing::warn!(level = tossing_level, "coin share combination failed");
            }
        } else {
            tracing::warn!(
                level = tossing_level,
                collected = shares.len(),
                needed = self.committee.coin_threshold(),
                "not enough coin shares collected"
            );
        }
        simple_coin(poset.hash(candidate), level)
    }

    /// The first dealing unit below `unit` in the dealer order of its
    /// level, skipping dealers the unit has fork evidence about.
    fn first_dealing_unit(&self, poset: &Poset, unit: UnitId) -> Option<UnitId> {
        for dealer in crp::dealer_order(self.committee.size(), poset.level(unit)) {
            if poset.has_forking_evidence(unit, dealer) {
                continue;
            }
            for &dealing in poset.dealing_units(dealer) {
                if poset.below(dealing, unit) {
                    return Some(dealing);
                }
            }
        }
        None
    }
}

/// A bit that depends deterministically on a hash and a level only.
fn simple_coin(hash: Hash, level: u64) -> bool {
    hash.bit(level)
}
