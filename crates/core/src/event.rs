//! Event types for the deterministic state machine.

use totem_types::{ProcessId, Transaction, Unit};

/// Priority levels for event ordering within the same timestamp.
///
/// Events at the same simulation time are processed in priority order.
/// Lower values = higher priority (processed first).
///
/// This ensures causality is preserved: internal events (consequences of
/// processing an event) are handled before new external inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum EventPriority {
    /// Internal events: consequences of prior event processing.
    /// Processed first to maintain causality.
    Internal = 0,

    /// Timer events: scheduled by the node itself.
    Timer = 1,

    /// Network events: external inputs from other nodes.
    Network = 2,

    /// Client events: external inputs from users.
    Client = 3,
}

/// All possible events a node can receive.
///
/// Events are **passive data** - they describe something that happened.
/// The state machine processes events and returns actions.
#[derive(Debug, Clone)]
pub enum Event {
    // ═══════════════════════════════════════════════════════════════════════
    // Timers (priority: Timer)
    // ═══════════════════════════════════════════════════════════════════════
    /// Time to attempt creating a new unit.
    CreateTimer,

    /// Time to initiate an outbound sync with a peer.
    SyncTimer,

    /// Periodic sweep of stale state (expired orphans).
    CleanupTimer,

    // ═══════════════════════════════════════════════════════════════════════
    // Network (priority: Network)
    // ═══════════════════════════════════════════════════════════════════════
    /// Received a unit, via announcement or a sync session.
    ///
    /// `source` is the peer the transport session authenticated against,
    /// when known; it is used for session-level misbehavior accounting,
    /// never for consensus (the unit speaks for its creator through its
    /// signature).
    UnitReceived {
        unit: Box<Unit>,
        source: Option<ProcessId>,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Async Callbacks (priority: Internal)
    // Results from delegated work (crypto)
    // ═══════════════════════════════════════════════════════════════════════
    /// Unit signature verification completed.
    ///
    /// Callback from `Action::VerifyUnitSignature`.
    UnitSignatureVerified {
        unit: Box<Unit>,
        source: Option<ProcessId>,
        /// Whether the signature is valid.
        valid: bool,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Client Requests (priority: Client)
    // ═══════════════════════════════════════════════════════════════════════
    /// Client submitted a transaction for ordering.
    TransactionSubmitted { tx: Transaction },
}

impl Event {
    /// Get the priority for this event type.
    ///
    /// Events at the same timestamp are processed in priority order,
    /// ensuring causality is preserved.
    pub fn priority(&self) -> EventPriority {
        match self {
            Event::UnitSignatureVerified { .. } => EventPriority::Internal,

            Event::CreateTimer | Event::SyncTimer | Event::CleanupTimer => EventPriority::Timer,

            Event::UnitReceived { .. } => EventPriority::Network,

            Event::TransactionSubmitted { .. } => EventPriority::Client,
        }
    }

    /// Check if this is an internal event (consequence of prior processing).
    pub fn is_internal(&self) -> bool {
        self.priority() == EventPriority::Internal
    }

    /// Check if this is a network event (from another node).
    pub fn is_network(&self) -> bool {
        self.priority() == EventPriority::Network
    }

    /// Get the event type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::CreateTimer => "CreateTimer",
            Event::SyncTimer => "SyncTimer",
            Event::CleanupTimer => "CleanupTimer",
            Event::UnitReceived { .. } => "UnitReceived",
            Event::UnitSignatureVerified { .. } => "UnitSignatureVerified",
            Event::TransactionSubmitted { .. } => "TransactionSubmitted",
        }
    }
}
