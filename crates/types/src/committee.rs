//! Committee membership and quorum arithmetic.

use crate::crypto::PublicKey;

/// Identity of a committee member, stable for the lifetime of a run.
///
/// Ids are dense integers in `[0, N)`; the wire form is a `u16`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u16);

impl ProcessId {
    /// The id as a usize index into per-process tables.
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Debug for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ProcessId({})", self.0)
    }
}

/// The fixed committee of N processes participating in a run.
///
/// Holds the verification keys, indexed by process id, and the
/// threshold-coin parameter. Quorum means a 2/3 supermajority:
/// `3 * count >= 2 * N`.
#[derive(Debug, Clone)]
pub struct Committee {
    members: Vec<PublicKey>,
    threshold: usize,
}

impl Committee {
    /// Build a committee from verification keys in process-id order,
    /// with the default coin threshold of `N/3 + 1`.
    pub fn new(members: Vec<PublicKey>) -> Self {
        let threshold = members.len() / 3 + 1;
        Self::with_threshold(members, threshold)
    }

    /// Build a committee with an explicit coin threshold.
    ///
    /// The threshold must satisfy `N/3 < threshold <= N`.
    pub fn with_threshold(members: Vec<PublicKey>, threshold: usize) -> Self {
        debug_assert!(threshold * 3 > members.len());
        debug_assert!(threshold <= members.len());
        Self { members, threshold }
    }

    /// Committee size N.
    pub fn size(&self) -> usize {
        self.members.len()
    }

    /// Maximum number of Byzantine processes tolerated.
    pub fn max_faulty(&self) -> usize {
        (self.size() - 1) / 3
    }

    /// Number of coin shares needed to flip a threshold coin.
    pub fn coin_threshold(&self) -> usize {
        self.threshold
    }

    /// Whether `count` processes form a 2/3 supermajority.
    pub fn is_quorum(&self, count: usize) -> bool {
        3 * count >= 2 * self.size()
    }

    /// The verification key for a process, if the id is in range.
    pub fn public_key(&self, pid: ProcessId) -> Option<&PublicKey> {
        self.members.get(pid.index())
    }

    /// Whether the id identifies a committee member.
    pub fn contains(&self, pid: ProcessId) -> bool {
        pid.index() < self.size()
    }

    /// All process ids in order.
    pub fn processes(&self) -> impl Iterator<Item = ProcessId> {
        (0..self.size() as u16).map(ProcessId)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    fn committee(n: usize) -> Committee {
        let members = (0..n)
            .map(|i| KeyPair::from_seed(&[i as u8; 32]).public_key())
            .collect();
        Committee::new(members)
    }

    #[test]
    fn quorum_thresholds() {
        let c = committee(4);
        assert!(!c.is_quorum(2));
        assert!(c.is_quorum(3));
        assert_eq!(c.max_faulty(), 1);

        let c = committee(10);
        assert!(!c.is_quorum(6));
        assert!(c.is_quorum(7));
        assert_eq!(c.max_faulty(), 3);
    }

    #[test]
    fn default_coin_threshold() {
        assert_eq!(committee(4).coin_threshold(), 2);
        assert_eq!(committee(10).coin_threshold(), 4);
    }

    #[test]
    fn member_lookup() {
        let c = committee(4);
        assert!(c.contains(ProcessId(3)));
        assert!(!c.contains(ProcessId(4)));
        assert!(c.public_key(ProcessId(0)).is_some());
        assert!(c.public_key(ProcessId(9)).is_none());
    }
}
