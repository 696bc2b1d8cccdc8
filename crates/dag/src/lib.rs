//! The Totem poset engine.
//!
//! A [`Poset`] is the per-process, append-only DAG of units ordered by
//! the parent relation. This crate owns the data structure and every
//! CPU-bound rule over it: floor maintenance, the `below` relation,
//! level and prime computation, compliance checking, greedy parent
//! selection for unit creation, and the orphan buffer for units whose
//! parents have not arrived yet.
//!
//! Nothing here performs I/O and nothing is asynchronous; the ordering
//! state machine drives the poset from the arbiter loop.

mod compliance;
mod creator;
mod orphans;
mod poset;
#[cfg(test)]
pub(crate) mod test_support;

pub use compliance::{ComplianceError, ComplianceParams};
pub use creator::{select_parents, AdaptiveDelay};
pub use orphans::OrphanBuffer;
pub use poset::{Candidate, Poset, PrepareError, UnitId};
