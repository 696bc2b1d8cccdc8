//! Wire payloads exchanged between Totem processes.
//!
//! Two families of payload exist: the pairwise sync handshake
//! ([`PosetSummary`] and [`UnitBatch`]) and the push announcement of a
//! freshly created unit ([`UnitAnnouncement`]). Transport framing
//! (length prefixes, version and kind bytes) lives with the production
//! networking code; this crate only defines payload encodings.

mod announce;
mod sync;

pub use announce::UnitAnnouncement;
pub use sync::{PosetSummary, SummaryEntry, UnitBatch};

use thiserror::Error;

/// Cap on units accepted in a single batch.
pub const MAX_BATCH_UNITS: usize = 65_536;

/// Errors decoding a message payload.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unexpected end of payload")]
    Truncated,

    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),

    #[error("summary entry for process {got} where {expected} was expected")]
    SummaryOrder { expected: u16, got: u16 },

    #[error("batch of {0} units exceeds limit")]
    OversizedBatch(usize),

    #[error("invalid unit in batch: {0}")]
    Unit(#[from] totem_types::WireError),
}
