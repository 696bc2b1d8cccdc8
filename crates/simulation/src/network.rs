//! Simulated network conditions.

use crate::NodeIndex;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::collections::HashSet;
use std::time::Duration;

/// Static network parameters for a simulation.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Fixed one-way latency floor.
    pub base_latency: Duration,
    /// Uniform random latency added on top of the floor.
    pub jitter: Duration,
    /// Probability a delivery is silently dropped.
    pub packet_loss: f64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            base_latency: Duration::from_millis(10),
            jitter: Duration::from_millis(15),
            packet_loss: 0.0,
        }
    }
}

/// Latency, loss and partitions between simulated nodes.
///
/// Partitions are symmetric and can be installed and healed while a
/// simulation runs.
pub struct SimulatedNetwork {
    config: NetworkConfig,
    partitions: HashSet<(NodeIndex, NodeIndex)>,
}

impl SimulatedNetwork {
    /// A fully connected network with the given parameters.
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            partitions: HashSet::new(),
        }
    }

    /// The static parameters.
    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Cut the link between two nodes, both directions.
    pub fn partition(&mut self, a: NodeIndex, b: NodeIndex) {
        self.partitions.insert(ordered(a, b));
    }

    /// Restore the link between two nodes.
    pub fn heal(&mut self, a: NodeIndex, b: NodeIndex) {
        self.partitions.remove(&ordered(a, b));
    }

    /// Restore every link.
    pub fn heal_all(&mut self) {
        self.partitions.clear();
    }

    /// Whether traffic between two nodes is currently cut.
    pub fn is_partitioned(&self, a: NodeIndex, b: NodeIndex) -> bool {
        self.partitions.contains(&ordered(a, b))
    }

    /// Sample whether a delivery is lost.
    pub fn should_drop_packet(&self, rng: &mut ChaCha8Rng) -> bool {
        self.config.packet_loss > 0.0 && rng.gen_bool(self.config.packet_loss)
    }

    /// Sample a one-way delivery latency.
    pub fn sample_latency(&self, rng: &mut ChaCha8Rng) -> Duration {
        let jitter_nanos = self.config.jitter.as_nanos() as u64;
        let jitter = if jitter_nanos == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(rng.gen_range(0..jitter_nanos))
        };
        self.config.base_latency + jitter
    }
}

fn ordered(a: NodeIndex, b: NodeIndex) -> (NodeIndex, NodeIndex) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn partitions_are_symmetric() {
        let mut net = SimulatedNetwork::new(NetworkConfig::default());
        net.partition(3, 1);
        assert!(net.is_partitioned(1, 3));
        assert!(net.is_partitioned(3, 1));
        net.heal(1, 3);
        assert!(!net.is_partitioned(3, 1));
    }

    #[test]
    fn latency_stays_in_bounds() {
        let net = SimulatedNetwork::new(NetworkConfig {
            base_latency: Duration::from_millis(5),
            jitter: Duration::from_millis(10),
            packet_loss: 0.0,
        });
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        for _ in 0..100 {
            let latency = net.sample_latency(&mut rng);
            assert!(latency >= Duration::from_millis(5));
            assert!(latency < Duration::from_millis(15));
        }
    }

    #[test]
    fn zero_loss_never_drops() {
        let net = SimulatedNetwork::new(NetworkConfig::default());
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        assert!((0..100).all(|_| !net.should_drop_packet(&mut rng)));
    }
}
