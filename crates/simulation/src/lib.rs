//! Deterministic simulation of a Totem committee.
//!
//! All nodes run inside one process against a global event queue
//! ordered by `(time, priority, node, sequence)`. Delegated work
//! executes inline, network delivery samples latency, loss and
//! partitions from a seeded RNG, and syncs are resolved directly
//! against peer posets. Given the same seed, a run is bit-for-bit
//! reproducible.

mod event_queue;
mod network;
mod runner;

pub use event_queue::EventKey;
pub use network::{NetworkConfig, SimulatedNetwork};
pub use runner::{SimulationRunner, SimulationStats};

/// Index type for simulation-only node routing; equals the process id.
pub type NodeIndex = u16;
