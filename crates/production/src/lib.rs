//! Production runner for a Totem process.
//!
//! Hosts the deterministic node state machine behind tokio I/O: a TCP
//! listener for inbound sync sessions and announcements, outbound sync
//! sessions on a gossip timer, a transaction intake listener, timer
//! tasks and a thread pool for signature verification. The event loop
//! in [`ProductionRunner::run`] is the arbiter: it is the only task
//! that touches the state machine, and sync sessions read the poset
//! exclusively through query messages it answers.

pub mod codec;
mod intake;
mod runner;
mod sync;
mod telemetry;
mod timers;

pub use runner::{ProductionRunner, RunnerError};
pub use sync::{PosetQuery, SyncError};
pub use telemetry::init_telemetry;
pub use timers::TimerManager;

use std::net::SocketAddr;
use totem_types::{NodeConfig, ProcessId};

/// Static deployment description for one process.
#[derive(Debug, Clone)]
pub struct ProductionConfig {
    /// This process's committee id.
    pub pid: ProcessId,
    /// Address to accept sync sessions and announcements on.
    pub listen_addr: SocketAddr,
    /// Peer addresses, indexed by process id; the entry for `pid`
    /// itself is ignored.
    pub peers: Vec<SocketAddr>,
    /// Address of the client transaction listener, if any.
    pub intake_addr: Option<SocketAddr>,
    /// Consensus configuration.
    pub node: NodeConfig,
}
