//! Threshold coin contract.
//!
//! The common coin used by the slow path of timing-unit election. The
//! contract is: `create_share(nonce)`, `verify_share(share, pid, nonce)`
//! and `combine_shares(shares, nonce) -> (bit, ok)`, where combining any
//! `threshold` distinct valid shares yields the same bit on every
//! process.
//!
//! The implementation here is a deterministic SHA-256 stand-in whose
//! dealing payload travels in the clear. Any BLS-style dual-threshold
//! scheme satisfying the same contract can be substituted without
//! touching the callers.

use crate::committee::ProcessId;
use crate::hash::{Hash, HASH_LENGTH};
use rand::RngCore;
use thiserror::Error;

const VK_DOMAIN: &[u8] = b"totem-coin-vk";
const SHARE_DOMAIN: &[u8] = b"totem-coin-share";

/// The payload a dealer embeds in its dealing unit: one verification
/// key plus one share key per process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DealtCoin {
    /// Verification key; also the seed of the combined coin bit.
    pub verification_key: Hash,
    /// Per-process share keys, indexed by process id.
    pub share_keys: Vec<Hash>,
}

impl DealtCoin {
    /// Deal a fresh coin for a committee of `n` processes.
    pub fn deal(n: usize, rng: &mut impl RngCore) -> Self {
        let mut master = [0u8; 32];
        rng.fill_bytes(&mut master);
        let verification_key = Hash::digest_parts(&[VK_DOMAIN, &master]);
        let share_keys = (0..n)
            .map(|i| Hash::digest_parts(&[SHARE_DOMAIN, &master, &(i as u16).to_le_bytes()]))
            .collect();
        Self {
            verification_key,
            share_keys,
        }
    }

    /// Serialize for the dealing unit's coin payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HASH_LENGTH * (1 + self.share_keys.len()));
        out.extend_from_slice(self.verification_key.as_bytes());
        for key in &self.share_keys {
            out.extend_from_slice(key.as_bytes());
        }
        out
    }

    /// Parse a dealing unit's coin payload for a committee of `n`.
    pub fn decode(payload: &[u8], n: usize) -> Result<Self, CoinError> {
        let expected = HASH_LENGTH * (1 + n);
        if payload.len() != expected {
            return Err(CoinError::PayloadLength {
                expected,
                got: payload.len(),
            });
        }
        let mut hashes = payload.chunks_exact(HASH_LENGTH).map(|chunk| {
            let mut bytes = [0u8; HASH_LENGTH];
            bytes.copy_from_slice(chunk);
            Hash::from_raw(bytes)
        });
        let verification_key = hashes.next().ok_or(CoinError::PayloadLength {
            expected,
            got: payload.len(),
        })?;
        let share_keys = hashes.collect();
        Ok(Self {
            verification_key,
            share_keys,
        })
    }
}

/// A single coin share carried by a prime unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoinShare(pub Hash);

impl CoinShare {
    /// Serialize for a unit's coin payload.
    pub fn encode(&self) -> Vec<u8> {
        self.0.as_bytes().to_vec()
    }

    /// Parse a unit's coin payload.
    pub fn decode(payload: &[u8]) -> Result<Self, CoinError> {
        if payload.len() != HASH_LENGTH {
            return Err(CoinError::PayloadLength {
                expected: HASH_LENGTH,
                got: payload.len(),
            });
        }
        let mut bytes = [0u8; HASH_LENGTH];
        bytes.copy_from_slice(payload);
        Ok(CoinShare(Hash::from_raw(bytes)))
    }
}

/// A threshold coin as seen by one process: the dealt material plus the
/// identity of the local share.
#[derive(Debug, Clone)]
pub struct ThresholdCoin {
    dealer: ProcessId,
    owner: ProcessId,
    threshold: usize,
    dealt: DealtCoin,
}

impl ThresholdCoin {
    /// Build from a dealing unit's payload.
    pub fn new(dealer: ProcessId, owner: ProcessId, threshold: usize, dealt: DealtCoin) -> Self {
        Self {
            dealer,
            owner,
            threshold,
            dealt,
        }
    }

    /// The process that dealt this coin.
    pub fn dealer(&self) -> ProcessId {
        self.dealer
    }

    /// Create the local process's share for `nonce`.
    pub fn create_share(&self, nonce: u64) -> CoinShare {
        self.share_for(self.owner, nonce)
    }

    /// Check a share claimed to come from `pid` for `nonce`.
    pub fn verify_share(&self, share: &CoinShare, pid: ProcessId, nonce: u64) -> bool {
        if pid.index() >= self.dealt.share_keys.len() {
            return false;
        }
        self.share_for(pid, nonce) == *share
    }

    /// Combine shares for `nonce`.
    ///
    /// Returns `(bit, ok)`; `ok` is false when fewer than `threshold`
    /// distinct valid shares were provided, in which case the bit must
    /// not be used.
    pub fn combine_shares(
        &self,
        shares: &std::collections::BTreeMap<ProcessId, CoinShare>,
        nonce: u64,
    ) -> (bool, bool) {
        let valid = shares
            .iter()
            .filter(|(pid, share)| self.verify_share(share, **pid, nonce))
            .count();
        if valid < self.threshold {
            return (false, false);
        }
        let bit = Hash::digest_parts(&[
            self.dealt.verification_key.as_bytes(),
            &nonce.to_le_bytes(),
        ])
        .bit(0);
        (bit, true)
    }

    fn share_for(&self, pid: ProcessId, nonce: u64) -> CoinShare {
        CoinShare(Hash::digest_parts(&[
            self.dealt.share_keys[pid.index()].as_bytes(),
            &nonce.to_le_bytes(),
        ]))
    }
}

/// Errors parsing coin payloads.
#[derive(Debug, Error)]
pub enum CoinError {
    #[error("coin payload length mismatch: expected {expected}, got {got}")]
    PayloadLength { expected: usize, got: usize },
}
