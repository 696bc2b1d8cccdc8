//! Outbound message types for network communication.

use totem_messages::UnitAnnouncement;

/// Outbound network messages.
///
/// These are the messages a node can push to other nodes outside of a
/// sync session. The runner handles the actual network I/O.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    /// Announcement of a freshly created unit.
    UnitAnnouncement(Box<UnitAnnouncement>),
}

impl OutboundMessage {
    /// Get a human-readable name for this message type.
    pub fn type_name(&self) -> &'static str {
        match self {
            OutboundMessage::UnitAnnouncement(_) => "UnitAnnouncement",
        }
    }
}
