//! Action types for the deterministic state machine.

use crate::{message::OutboundMessage, Event, TimerId};
use std::time::Duration;
use totem_types::{OrderedBatch, ProcessId, PublicKey, Unit};

/// Actions the state machine wants to perform.
///
/// Actions are **commands** - they describe something to do.
/// The runner executes actions and may convert results back into events.
#[derive(Debug, Clone)]
pub enum Action {
    // ═══════════════════════════════════════════════════════════════════════
    // Network
    // ═══════════════════════════════════════════════════════════════════════
    /// Broadcast a message to every other committee member.
    Broadcast { message: OutboundMessage },

    /// Open an outbound sync session with `peer`.
    ///
    /// The runner owns the session I/O: it exchanges poset summaries,
    /// ships missing units both ways and delivers received units back as
    /// `Event::UnitReceived`. Sessions are bounded by the configured
    /// outgoing cap.
    StartSync { peer: ProcessId },

    // ═══════════════════════════════════════════════════════════════════════
    // Timers
    // ═══════════════════════════════════════════════════════════════════════
    /// Set a timer to fire after a duration.
    SetTimer { id: TimerId, duration: Duration },

    /// Cancel a previously set timer.
    CancelTimer { id: TimerId },

    // ═══════════════════════════════════════════════════════════════════════
    // Internal (fed back as events with Internal priority)
    // ═══════════════════════════════════════════════════════════════════════
    /// Enqueue an internal event for immediate processing.
    EnqueueInternal { event: Event },

    // ═══════════════════════════════════════════════════════════════════════
    // Delegated Work (async, returns callback event)
    // ═══════════════════════════════════════════════════════════════════════
    /// Verify a received unit's signature.
    ///
    /// Delegated to a thread pool in production, instant in simulation.
    /// Returns `Event::UnitSignatureVerified` when complete.
    VerifyUnitSignature {
        /// The unit to verify.
        unit: Box<Unit>,
        /// Session peer the unit arrived from, for misbehavior tracking.
        source: Option<ProcessId>,
        /// Public key of the creator (pre-resolved by the state machine).
        public_key: PublicKey,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // External Notifications
    // ═══════════════════════════════════════════════════════════════════════
    /// Emit a newly committed extension of the linear order.
    ///
    /// The prefix is append-only; batches arrive in round order.
    EmitOrderedBatch { batch: OrderedBatch },

    /// Report a peer that sent malformed or non-compliant data.
    ///
    /// The runner aborts any session with the peer; gossip in later
    /// rounds is unaffected (transport misbehavior is per-session).
    ReportMisbehavior { peer: ProcessId, reason: String },

    /// A fatal local error; the runner shuts down all tasks cooperatively.
    Shutdown { reason: String },
}

impl Action {
    /// Check if this action is delegated work (runs on thread pool, returns callback).
    pub fn is_delegated(&self) -> bool {
        matches!(self, Action::VerifyUnitSignature { .. })
    }

    /// Check if this is an internal event action.
    pub fn is_internal(&self) -> bool {
        matches!(self, Action::EnqueueInternal { .. })
    }

    /// Get the action type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::Broadcast { .. } => "Broadcast",
            Action::StartSync { .. } => "StartSync",
            Action::SetTimer { .. } => "SetTimer",
            Action::CancelTimer { .. } => "CancelTimer",
            Action::EnqueueInternal { .. } => "EnqueueInternal",
            Action::VerifyUnitSignature { .. } => "VerifyUnitSignature",
            Action::EmitOrderedBatch { .. } => "EmitOrderedBatch",
            Action::ReportMisbehavior { .. } => "ReportMisbehavior",
            Action::Shutdown { .. } => "Shutdown",
        }
    }
}
