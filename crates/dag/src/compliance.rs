//! Compliance rules for candidate units.
//!
//! A unit is admitted to the poset only if it satisfies every rule
//! here. Signature and hash validity are established earlier, on the
//! delegated verification path; these checks assume a structurally
//! valid, authentic unit whose parents are all present.

use crate::poset::{Candidate, Poset, UnitId};
use std::collections::{BTreeSet, HashSet};
use thiserror::Error;
use totem_types::{CoinShare, DealtCoin, Hash, ProcessId};

/// Tunables the compliance check needs from the node configuration.
#[derive(Debug, Clone, Copy)]
pub struct ComplianceParams {
    /// Level from which prime units must carry a coin share.
    pub add_shares: u64,
}

/// A compliance violation; the offending unit is discarded.
#[derive(Debug, Error)]
pub enum ComplianceError {
    #[error("dealing unit with non-zero height {0}")]
    DealingHeight(u64),

    #[error("first parent created by {parent} but unit by {creator}")]
    PredecessorCreator { creator: ProcessId, parent: ProcessId },

    #[error("height {height} does not extend predecessor height {predecessor}")]
    HeightMismatch { height: u64, predecessor: u64 },

    #[error("two parents share creator {0}")]
    DuplicateParentCreator(ProcessId),

    #[error("dealing unit carries malformed coin material")]
    MalformedDealtCoin,

    #[error("unit proves its own creator forked")]
    SelfForkEvidence,

    #[error("parent {parent:?} endorses forker {forker}")]
    ForkerEndorsement { parent: Hash, forker: ProcessId },

    #[error("parents do not expand the seen prime units")]
    ExpandPrimes,

    #[error("prime unit at level {level} carries a bad coin share")]
    BadCoinShare { level: u64 },

    #[error("non-prime unit carries a coin payload")]
    UnexpectedCoinPayload,
}

impl Poset {
    /// Check a prepared candidate against all admission rules.
    pub fn check_compliance(
        &self,
        candidate: &Candidate,
        params: &ComplianceParams,
    ) -> Result<(), ComplianceError> {
        let unit = candidate.unit();
        let creator = unit.creator();

        if candidate.parents().is_empty() {
            if unit.height() != 0 {
                return Err(ComplianceError::DealingHeight(unit.height()));
            }
            // A dealing unit's payload must be a well-formed dealt coin;
            // its validity cannot be checked locally, only its shape.
            DealtCoin::decode(unit.coin_payload(), self.committee_size())
                .map_err(|_| ComplianceError::MalformedDealtCoin)?;
            return Ok(());
        }

        let predecessor = candidate.parents()[0];
        if self.creator(predecessor) != creator {
            return Err(ComplianceError::PredecessorCreator {
                creator,
                parent: self.creator(predecessor),
            });
        }
        if self.height(predecessor) + 1 != unit.height() {
            return Err(ComplianceError::HeightMismatch {
                height: unit.height(),
                predecessor: self.height(predecessor),
            });
        }

        let mut seen_creators = HashSet::with_capacity(candidate.parents().len());
        for &parent in candidate.parents() {
            if !seen_creators.insert(self.creator(parent)) {
                return Err(ComplianceError::DuplicateParentCreator(self.creator(parent)));
            }
        }

        // The combined parent floor for the creator must be a single
        // chain tip, otherwise the unit is a self-confessed fork.
        if candidate.floor_slot(creator).len() != 1 {
            return Err(ComplianceError::SelfForkEvidence);
        }

        self.check_forker_muting(candidate.parents())?;

        if !self.check_expand_primes(candidate.parents()) {
            return Err(ComplianceError::ExpandPrimes);
        }

        self.check_coin_payload(candidate, params)?;
        Ok(())
    }

    /// Forker-muting policy: no parent may carry fork evidence about
    /// any process that created one of the parents.
    fn check_forker_muting(&self, parents: &[UnitId]) -> Result<(), ComplianceError> {
        let parent_creators: HashSet<ProcessId> =
            parents.iter().map(|&p| self.creator(p)).collect();
        for &parent in parents {
            for &proc in &parent_creators {
                if self.has_forking_evidence(parent, proc) {
                    return Err(ComplianceError::ForkerEndorsement {
                        parent: self.hash(parent),
                        forker: proc,
                    });
                }
            }
        }
        Ok(())
    }

    /// The expand-primes rule.
    ///
    /// Parents are scanned in order. Let L be the level of the last
    /// scanned parent and P the prime units of level L below all
    /// parents scanned so far. The next parent must either have a level
    /// above L, or have level-L prime units below it outside P.
    ///
    /// Also used by the parent selector to only propose legal sequences.
    pub fn check_expand_primes(&self, parents: &[UnitId]) -> bool {
        if parents.is_empty() {
            return true;
        }
        let mut level = self.level(parents[0]);
        let mut seen: BTreeSet<UnitId> = self.primes_below(level, parents[0]).into_iter().collect();
        for &parent in &parents[1..] {
            if self.level(parent) > level {
                level = self.level(parent);
                seen.clear();
            }
            let below_parent: BTreeSet<UnitId> =
                self.primes_below(level, parent).into_iter().collect();
            if below_parent.is_subset(&seen) {
                return false;
            }
            seen.extend(below_parent);
        }
        true
    }

    /// Prime units from `add_shares` up carry exactly one coin share;
    /// prime units beneath carry nothing. Non-prime units are not
    /// checked, mirroring the election's share collection, which only
    /// ever reads primes.
    fn check_coin_payload(
        &self,
        candidate: &Candidate,
        params: &ComplianceParams,
    ) -> Result<(), ComplianceError> {
        if !candidate.prime() {
            return Ok(());
        }
        let unit = candidate.unit();
        if candidate.level() >= params.add_shares {
            CoinShare::decode(unit.coin_payload()).map_err(|_| ComplianceError::BadCoinShare {
                level: candidate.level(),
            })?;
        } else if !unit.coin_payload().is_empty() {
            return Err(ComplianceError::UnexpectedCoinPayload);
        }
        Ok(())
    }
}

impl Candidate {
    pub(crate) fn floor_slot(&self, pid: ProcessId) -> &[UnitId] {
        &self.floor[pid.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::DagBuilder;
    use totem_types::test_utils::test_committee;
    use totem_types::{UnitDraft, Transaction};

    const PARAMS: ComplianceParams = ComplianceParams { add_shares: 4 };

    fn check(dag: &DagBuilder, unit: totem_types::Unit) -> Result<(), ComplianceError> {
        let candidate = dag.poset.prepare(unit).expect("prepare");
        dag.poset.check_compliance(&candidate, &PARAMS)
    }

    fn dealt_payload(n: usize) -> Vec<u8> {
        use rand::rngs::StdRng;
        use rand::SeedableRng;
        let mut rng = StdRng::seed_from_u64(1);
        totem_types::DealtCoin::deal(n, &mut rng).encode()
    }

    #[test]
    fn well_formed_dealing_unit_passes() {
        let dag = DagBuilder::new(4);
        let (_, keys) = test_committee(4);
        let unit = UnitDraft {
            creator: totem_types::ProcessId(0),
            height: 0,
            parents: vec![],
            txs: vec![],
            coin_payload: dealt_payload(4),
        }
        .sign(&keys[0]);
        assert!(check(&dag, unit).is_ok());
    }

    #[test]
    fn dealing_unit_needs_coin_material() {
        let dag = DagBuilder::new(4);
        let unit = dag.signed_unit(0, 0, vec![], 0);
        assert!(matches!(
            check(&dag, unit),
            Err(ComplianceError::MalformedDealtCoin)
        ));
    }

    #[test]
    fn dealing_unit_height_must_be_zero() {
        let dag = DagBuilder::new(4);
        let (_, keys) = test_committee(4);
        let unit = UnitDraft {
            creator: totem_types::ProcessId(0),
            height: 3,
            parents: vec![],
            txs: vec![],
            coin_payload: dealt_payload(4),
        }
        .sign(&keys[0]);
        assert!(matches!(
            check(&dag, unit),
            Err(ComplianceError::DealingHeight(3))
        ));
    }

    #[test]
    fn first_parent_must_be_own_predecessor() {
        let mut dag = DagBuilder::new(4);
        let d0 = dag.add_dealing(0);
        let d1 = dag.add_dealing(1);
        // Creator 0 lists creator 1's unit first.
        let unit = dag.signed_unit(0, 1, vec![dag.poset.hash(d1), dag.poset.hash(d0)], 1);
        assert!(matches!(
            check(&dag, unit),
            Err(ComplianceError::PredecessorCreator { .. })
        ));
    }

    #[test]
    fn height_must_extend_predecessor() {
        let mut dag = DagBuilder::new(4);
        let d0 = dag.add_dealing(0);
        let d1 = dag.add_dealing(1);
        let unit = dag.signed_unit(0, 7, vec![dag.poset.hash(d0), dag.poset.hash(d1)], 1);
        assert!(matches!(
            check(&dag, unit),
            Err(ComplianceError::HeightMismatch { height: 7, .. })
        ));
    }

    #[test]
    fn parents_must_have_distinct_creators() {
        let mut dag = DagBuilder::new(4);
        let deals: Vec<_> = (0..3).map(|i| dag.add_dealing(i)).collect();
        let u1 = dag.add_unit(1, &[deals[1], deals[0]]);
        let unit = dag.signed_unit(
            0,
            1,
            vec![
                dag.poset.hash(deals[0]),
                dag.poset.hash(deals[1]),
                dag.poset.hash(u1),
            ],
            1,
        );
        assert!(matches!(
            check(&dag, unit),
            Err(ComplianceError::DuplicateParentCreator(p)) if p.0 == 1
        ));
    }

    #[test]
    fn self_fork_evidence_is_rejected() {
        let mut dag = DagBuilder::new(4);
        let deals: Vec<_> = (0..4).map(|i| dag.add_dealing(i)).collect();
        // Process 2 forks at height 1.
        let f1 = dag.add_unit_with_txs(2, &[deals[2], deals[0]], 1);
        let f2 = dag.add_unit_with_txs(2, &[deals[2], deals[1]], 2);
        // Units above each branch, by different creators.
        let a = dag.add_unit(0, &[deals[0], f1]);
        let b = dag.add_unit(1, &[deals[1], f2]);
        // A further unit by process 2 whose parents jointly see both
        // branches confesses the fork.
        let unit = dag.signed_unit(
            2,
            2,
            vec![dag.poset.hash(f1), dag.poset.hash(a), dag.poset.hash(b)],
            3,
        );
        assert!(matches!(
            check(&dag, unit),
            Err(ComplianceError::SelfForkEvidence)
        ));
    }

    #[test]
    fn forker_endorsement_is_rejected() {
        let mut dag = DagBuilder::new(4);
        let deals: Vec<_> = (0..4).map(|i| dag.add_dealing(i)).collect();
        let f1 = dag.add_unit_with_txs(2, &[deals[2], deals[0]], 1);
        let f2 = dag.add_unit_with_txs(2, &[deals[2], deals[1]], 2);
        // Unit by 0 that sees both branches: it carries fork evidence
        // about process 2.
        let witness = dag.add_unit(0, &[deals[0], f1, f2]);
        // Creator 1 cannot both use the witness and a unit by forker 2.
        let unit = dag.signed_unit(
            1,
            1,
            vec![dag.poset.hash(deals[1]), dag.poset.hash(witness), dag.poset.hash(f1)],
            3,
        );
        assert!(matches!(
            check(&dag, unit),
            Err(ComplianceError::ForkerEndorsement { forker, .. }) if forker.0 == 2
        ));
    }

    #[test]
    fn expand_primes_rejects_redundant_parent() {
        let mut dag = DagBuilder::new(4);
        let deals: Vec<_> = (0..4).map(|i| dag.add_dealing(i)).collect();
        // u sees every level-0 prime already.
        let u = dag.add_unit(1, &[deals[1], deals[0], deals[2], deals[3]]);
        // d0 adds no prime unit beyond what u already covers.
        let unit = dag.signed_unit(
            0,
            1,
            vec![dag.poset.hash(deals[0]), dag.poset.hash(u), dag.poset.hash(deals[2])],
            1,
        );
        assert!(matches!(
            check(&dag, unit),
            Err(ComplianceError::ExpandPrimes)
        ));
    }

    #[test]
    fn expand_primes_accepts_growing_parents() {
        let mut dag = DagBuilder::new(4);
        let deals: Vec<_> = (0..4).map(|i| dag.add_dealing(i)).collect();
        let unit = dag.signed_unit(
            0,
            1,
            vec![
                dag.poset.hash(deals[0]),
                dag.poset.hash(deals[1]),
                dag.poset.hash(deals[2]),
            ],
            1,
        );
        assert!(check(&dag, unit).is_ok());
    }

    #[test]
    fn low_level_prime_must_not_carry_payload() {
        let mut dag = DagBuilder::new(4);
        let deals: Vec<_> = (0..4).map(|i| dag.add_dealing(i)).collect();
        let (_, keys) = test_committee(4);
        // Reaches level 1 (prime), below add_shares, with a stray payload.
        let unit = UnitDraft {
            creator: totem_types::ProcessId(0),
            height: 1,
            parents: vec![
                dag.poset.hash(deals[0]),
                dag.poset.hash(deals[1]),
                dag.poset.hash(deals[2]),
            ],
            txs: vec![Transaction::new(vec![9])],
            coin_payload: vec![0xab],
        }
        .sign(&keys[0]);
        assert!(matches!(
            check(&dag, unit),
            Err(ComplianceError::UnexpectedCoinPayload)
        ));
    }
}
