//! State machine traits.

use crate::{Action, Event};
use std::time::Duration;

/// A deterministic, synchronous state machine.
///
/// The runner sets the time before each call; `handle` must not perform
/// I/O or block.
pub trait StateMachine {
    /// Process one event, returning the actions it triggers.
    fn handle(&mut self, event: Event) -> Vec<Action>;

    /// Advance the machine's notion of the current time.
    fn set_time(&mut self, now: Duration);

    /// The machine's current time.
    fn now(&self) -> Duration;
}

/// A component state machine composed into a larger one.
///
/// `try_handle` returns `None` for events the component does not care
/// about, letting the composer route an event past several components.
pub trait SubStateMachine {
    /// Process the event if it belongs to this component.
    fn try_handle(&mut self, event: &Event) -> Option<Vec<Action>>;

    /// Advance the component's notion of the current time.
    fn set_time(&mut self, now: Duration);
}
