//! Deterministic ordering of simulation events.

use crate::NodeIndex;
use std::time::Duration;
use totem_core::{Event, EventPriority};

/// Sort key for the global event queue.
///
/// Events order by time, then priority (internal before timers before
/// network before client), then target node, then an insertion
/// sequence number. The sequence keeps delivery order stable for
/// events that tie on everything else, such as a batch of units from
/// one sync session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EventKey {
    pub time: Duration,
    pub priority: EventPriority,
    pub node: NodeIndex,
    pub seq: u64,
}

impl EventKey {
    /// Build the key for delivering `event` to `node` at `time`.
    pub fn new(time: Duration, event: &Event, node: NodeIndex, seq: u64) -> Self {
        Self {
            time,
            priority: event.priority(),
            node,
            seq,
        }
    }
}
