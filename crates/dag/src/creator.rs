//! Unit creation: greedy parent selection and the adaptive delay.

use crate::poset::{Poset, UnitId};
use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use totem_types::{NodeConfig, ProcessId};

/// Pick parents for the next unit by `creator`.
///
/// The creator's own latest unit is the first parent. Further parents
/// are drawn greedily from the globally maximal units, most recently
/// added first: first those of the maximal level in the poset, then
/// those at the predecessor's level (inserted before the higher-level
/// picks, which is the only legal position). Every pick must keep the
/// parent sequence legal under the expand-primes rule, the distinct
/// creator rule and the forker-muting policy, and respect `max_parents`.
///
/// Returns `None` when no parent beyond the predecessor qualifies; the
/// caller abandons the attempt and retries after the next delay.
pub fn select_parents(
    poset: &Poset,
    creator: ProcessId,
    max_parents: usize,
) -> Option<Vec<UnitId>> {
    let predecessor = poset.latest_own(creator)?;
    let predecessor_level = poset.level(predecessor);
    let top_level = poset
        .max_units()
        .iter()
        .map(|&u| poset.level(u))
        .max()
        .unwrap_or(0);

    let mut high: Vec<UnitId> = Vec::new();
    let mut same: Vec<UnitId> = Vec::new();
    let mut creators: HashSet<ProcessId> = HashSet::new();
    creators.insert(creator);

    let assemble = |same: &[UnitId], high: &[UnitId]| -> Vec<UnitId> {
        let mut parents = Vec::with_capacity(1 + same.len() + high.len());
        parents.push(predecessor);
        parents.extend_from_slice(same);
        parents.extend_from_slice(high);
        parents
    };

    let eligible = |v: UnitId, creators: &HashSet<ProcessId>| -> bool {
        let vc = poset.creator(v);
        vc != creator && !creators.contains(&vc) && !poset.is_forker(vc)
    };

    // Maximal units of maximal level, most recent first.
    for &v in poset.max_units().iter().rev() {
        if 1 + high.len() >= max_parents {
            break;
        }
        if poset.level(v) != top_level || !eligible(v, &creators) {
            continue;
        }
        let mut trial = high.clone();
        trial.push(v);
        let parents = assemble(&[], &trial);
        if poset.check_expand_primes(&parents) && muting_ok(poset, &parents) {
            high = trial;
            creators.insert(poset.creator(v));
        }
    }

    // Maximal units at the predecessor's level slot in before the
    // higher-level parents.
    if top_level > predecessor_level {
        for &v in poset.max_units().iter().rev() {
            if 1 + same.len() + high.len() >= max_parents {
                break;
            }
            if poset.level(v) != predecessor_level || !eligible(v, &creators) {
                continue;
            }
            let mut trial = same.clone();
            trial.push(v);
            let parents = assemble(&trial, &high);
            if poset.check_expand_primes(&parents) && muting_ok(poset, &parents) {
                same = trial;
                creators.insert(poset.creator(v));
            }
        }
    }

    let parents = assemble(&same, &high);
    if parents.len() < 2 {
        return None;
    }
    Some(parents)
}

/// Would the parent sequence violate the forker-muting policy?
fn muting_ok(poset: &Poset, parents: &[UnitId]) -> bool {
    let creators: Vec<ProcessId> = parents.iter().map(|&p| poset.creator(p)).collect();
    parents.iter().all(|&p| {
        creators
            .iter()
            .all(|&proc| !poset.has_forking_evidence(p, proc))
    })
}

/// Adaptive creation delay.
///
/// Watches the levels of the last three self-created units. Three
/// creations stuck at one level mean the committee is outpacing us and
/// creating faster will not help, so the delay grows; steady level
/// progress shrinks it. Both directions stay within configured bounds.
#[derive(Debug)]
pub struct AdaptiveDelay {
    current: Duration,
    min: Duration,
    max: Duration,
    recent_levels: VecDeque<u64>,
}

const WINDOW: usize = 3;
const GROWTH: f64 = 1.5;
const DECAY: f64 = 0.8;

impl AdaptiveDelay {
    /// Start from the configured initial delay and bounds.
    pub fn new(config: &NodeConfig) -> Self {
        Self {
            current: config.create_delay,
            min: config.min_create_delay,
            max: config.max_create_delay,
            recent_levels: VecDeque::with_capacity(WINDOW),
        }
    }

    /// The delay to wait before the next creation attempt.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Record the level of a freshly created own unit and adapt.
    pub fn record_level(&mut self, level: u64) {
        if self.recent_levels.len() == WINDOW {
            self.recent_levels.pop_front();
        }
        self.recent_levels.push_back(level);
        if self.recent_levels.len() < WINDOW {
            return;
        }
        let first = self.recent_levels[0];
        let last = self.recent_levels[WINDOW - 1];
        if self.recent_levels.iter().all(|&l| l == first) {
            self.current = self.current.mul_f64(GROWTH).min(self.max);
        } else if last > first {
            self.current = self.current.mul_f64(DECAY).max(self.min);
        }
    }
}
