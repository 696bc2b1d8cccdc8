//! Content hashes.

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Length of a hash in bytes.
pub const HASH_LENGTH: usize = 32;

/// A SHA-256 content hash.
///
/// Units are content-addressed by this type; it is also the raw material
/// for deterministic coin bits and tie-breaking.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash(pub [u8; HASH_LENGTH]);

impl Hash {
    /// The all-zero hash.
    pub const ZERO: Hash = Hash([0u8; HASH_LENGTH]);

    /// Hash arbitrary bytes with SHA-256.
    pub fn digest(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Hash(hasher.finalize().into())
    }

    /// Hash the concatenation of several byte slices.
    pub fn digest_parts(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part);
        }
        Hash(hasher.finalize().into())
    }

    /// Wrap raw bytes without hashing.
    pub fn from_raw(bytes: [u8; HASH_LENGTH]) -> Self {
        Hash(bytes)
    }

    /// View the hash as a byte slice.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Extract the bit at `index` (mod the hash length in bits).
    ///
    /// Used by the deterministic fallback coin.
    pub fn bit(&self, index: u64) -> bool {
        let i = (index % (8 * HASH_LENGTH as u64)) as usize;
        (self.0[i / 8] >> (i % 8)) & 1 == 1
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, HexError> {
        if s.len() != 2 * HASH_LENGTH {
            return Err(HexError::Length(s.len()));
        }
        let mut bytes = [0u8; HASH_LENGTH];
        for (i, byte) in bytes.iter_mut().enumerate() {
            let pair = &s[2 * i..2 * i + 2];
            *byte = u8::from_str_radix(pair, 16).map_err(|_| HexError::Digit)?;
        }
        Ok(Hash(bytes))
    }
}

/// Errors parsing a hex-encoded hash.
#[derive(Debug, Error)]
pub enum HexError {
    #[error("expected 64 hex characters, got {0}")]
    Length(usize),

    #[error("invalid hex digit")]
    Digit,
}

impl std::fmt::Display for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short prefix is enough to tell units apart in logs.
        for byte in &self.0[..4] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable() {
        let a = Hash::digest(b"hello");
        let b = Hash::digest(b"hello");
        let c = Hash::digest(b"world");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn hex_round_trip() {
        let h = Hash::digest(b"round trip");
        let parsed = Hash::from_hex(&h.to_string()).unwrap();
        assert_eq!(h, parsed);
    }

    #[test]
    fn hex_rejects_bad_input() {
        assert!(matches!(Hash::from_hex("abcd"), Err(HexError::Length(4))));
        let bad = "zz".repeat(32);
        assert!(matches!(Hash::from_hex(&bad), Err(HexError::Digit)));
    }

    #[test]
    fn bit_extraction_wraps() {
        let h = Hash::from_raw([0xff; 32]);
        assert!(h.bit(0));
        assert!(h.bit(255));
        assert!(h.bit(256)); // wraps back to bit 0
        let z = Hash::ZERO;
        assert!(!z.bit(17));
    }
}
