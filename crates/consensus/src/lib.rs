//! Timing-unit election and linear ordering.
//!
//! This crate turns the partial order maintained by `totem-dag` into a
//! total one. Per level it elects a *timing unit* among the prime units
//! via popularity proofs, supermajority voting and, when the fast paths
//! stall, a threshold-coin protocol; each decided timing unit then
//! extends the append-only linear order with its not-yet-ordered lower
//! cone.
//!
//! [`OrderingState`] is the sub-state machine gluing it all together:
//! it owns the poset and drives unit admission, creation and sync
//! scheduling from the arbiter loop.

mod crp;
mod election;
mod order;
mod state;

pub use crp::{candidate_order, dealer_order};
pub use election::{Election, ElectionParams};
pub use order::Extender;
pub use state::OrderingState;
