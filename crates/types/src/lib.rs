//! Core types for Totem consensus.
//!
//! This crate provides the foundational types used throughout the
//! consensus implementation:
//!
//! - **Primitives**: [`Hash`], signing keys and signatures
//! - **Identities**: [`ProcessId`], [`Committee`]
//! - **Protocol data**: [`Unit`] with its wire form, [`Transaction`],
//!   threshold-coin material, ordered output batches
//! - **Configuration**: [`NodeConfig`]
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not
//! depend on any other workspace crates, making it the foundation layer.

mod coin;
mod committee;
mod config;
mod crypto;
mod hash;
mod ordered;
mod transaction;
mod unit;

pub use coin::{CoinError, CoinShare, DealtCoin, ThresholdCoin};
pub use committee::{Committee, ProcessId};
pub use config::{GossipStrategy, NodeConfig};
pub use crypto::{KeyPair, PublicKey, Signature, SIGNATURE_LENGTH};
pub use hash::{Hash, HexError, HASH_LENGTH};
pub use ordered::{OrderedBatch, OrderedUnit};
pub use transaction::Transaction;
pub use unit::{
    Unit, UnitDraft, WireError, MAX_WIRE_COIN_BYTES, MAX_WIRE_PARENTS, MAX_WIRE_TXS,
    MAX_WIRE_TX_BYTES,
};

/// Test utilities.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils {
    use super::*;

    /// Deterministic key pair for process `i` of a test committee.
    pub fn test_keypair(i: usize) -> KeyPair {
        let mut seed = [0u8; 32];
        seed[..8].copy_from_slice(&(i as u64).wrapping_mul(0x517c_c1b7_2722_0a95).to_le_bytes());
        seed[8..16].copy_from_slice(&(i as u64).to_le_bytes());
        KeyPair::from_seed(&seed)
    }

    /// A test committee of `n` processes with its signing keys.
    pub fn test_committee(n: usize) -> (Committee, Vec<KeyPair>) {
        let keys: Vec<KeyPair> = (0..n).map(test_keypair).collect();
        let committee = Committee::new(keys.iter().map(|k| k.public_key()).collect());
        (committee, keys)
    }

    /// A small unique transaction derived from a seed byte.
    pub fn test_tx(seed: u8) -> Transaction {
        Transaction::new(vec![seed, seed.wrapping_add(1), seed.wrapping_add(2)])
    }
}
