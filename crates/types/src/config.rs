//! Node configuration.

use std::time::Duration;

/// Peer-selection strategy for gossip.
///
/// New strategies are added as variants, not runtime plugins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GossipStrategy {
    /// Pick a peer uniformly at random.
    #[default]
    UniformRandom,
}

/// Per-process configuration for the consensus core.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Initial minimum delay between own unit creations. Adapted at
    /// runtime within `[min_create_delay, max_create_delay]`.
    pub create_delay: Duration,

    /// Lower bound for the adaptive creation delay.
    pub min_create_delay: Duration,

    /// Upper bound for the adaptive creation delay.
    pub max_create_delay: Duration,

    /// Minimum delay between initiated syncs.
    pub sync_delay: Duration,

    /// Cap on transactions per created unit.
    pub txs_per_unit: usize,

    /// Cap on parents per unit.
    pub max_parents: usize,

    /// Cap on concurrently accepted inbound sync sessions.
    pub max_incoming_syncs: usize,

    /// Cap on concurrently initiated outbound sync sessions.
    pub max_outgoing_syncs: usize,

    /// Peer selection for gossip.
    pub gossip_strategy: GossipStrategy,

    /// First voting level offset of the election (`t` in the fast
    /// consensus algorithm).
    pub voting_level: u64,

    /// Level offset at which the election switches to the pi-delta
    /// protocol.
    pub pi_delta_level: u64,

    /// Level from which prime units carry threshold-coin shares.
    pub add_shares: u64,

    /// How long an orphan unit may wait for its missing parents.
    pub orphan_ttl: Duration,

    /// Cap on buffered orphan units.
    pub orphan_capacity: usize,

    /// Wall-clock deadline for each phase of a sync session.
    pub sync_phase_timeout: Duration,

    /// Capacity of the arbiter's inbound event queue.
    pub event_queue_capacity: usize,

    /// Cap on queued transactions awaiting inclusion.
    pub mempool_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            create_delay: Duration::from_millis(500),
            min_create_delay: Duration::from_millis(100),
            max_create_delay: Duration::from_secs(4),
            sync_delay: Duration::from_millis(125),
            txs_per_unit: 100,
            max_parents: 20,
            max_incoming_syncs: 10,
            max_outgoing_syncs: 10,
            gossip_strategy: GossipStrategy::UniformRandom,
            voting_level: 3,
            pi_delta_level: 12,
            add_shares: 4,
            orphan_ttl: Duration::from_secs(30),
            orphan_capacity: 4096,
            sync_phase_timeout: Duration::from_secs(10),
            event_queue_capacity: 1024,
            mempool_capacity: 100_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        let cfg = NodeConfig::default();
        assert!(cfg.min_create_delay <= cfg.create_delay);
        assert!(cfg.create_delay <= cfg.max_create_delay);
        assert!(cfg.voting_level >= 3);
        assert!(cfg.pi_delta_level > cfg.voting_level);
    }
}
