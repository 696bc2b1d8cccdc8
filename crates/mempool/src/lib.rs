//! Transaction intake queue.

mod state;

pub use state::MempoolState;
