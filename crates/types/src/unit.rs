//! Units: the signed building blocks of the poset.
//!
//! # Wire form
//!
//! ```text
//! creator_id:   u16 (LE)
//! height:       u64 (LE)
//! parents:      u32 count, then 32 bytes per parent hash
//! transactions: u32 count, then (u32 length, bytes) per transaction
//! coin payload: u32 length, opaque bytes
//! signature:    64 bytes
//! ```
//!
//! The signature covers everything before it; the unit hash is SHA-256
//! over the full serialization including the signature. The first
//! parent, when present, is the creator's own previous unit.

use crate::coin::{CoinError, CoinShare, DealtCoin};
use crate::committee::ProcessId;
use crate::crypto::{KeyPair, PublicKey, Signature, SIGNATURE_LENGTH};
use crate::hash::{Hash, HASH_LENGTH};
use crate::transaction::Transaction;
use thiserror::Error;

/// Cap on parents accepted off the wire; the compliance layer enforces
/// the much tighter configured `max_parents`.
pub const MAX_WIRE_PARENTS: usize = 1024;
/// Cap on transactions accepted off the wire.
pub const MAX_WIRE_TXS: usize = 65_536;
/// Cap on a single transaction's byte length off the wire.
pub const MAX_WIRE_TX_BYTES: usize = 1 << 20;
/// Cap on the coin payload's byte length off the wire.
pub const MAX_WIRE_COIN_BYTES: usize = 1 << 20;

/// An immutable, signed, content-addressed unit.
#[derive(Clone, PartialEq, Eq)]
pub struct Unit {
    creator: ProcessId,
    height: u64,
    parents: Vec<Hash>,
    txs: Vec<Transaction>,
    coin_payload: Vec<u8>,
    signature: Signature,
    hash: Hash,
}

/// The unsigned fields of a unit under construction.
#[derive(Debug, Clone)]
pub struct UnitDraft {
    pub creator: ProcessId,
    pub height: u64,
    pub parents: Vec<Hash>,
    pub txs: Vec<Transaction>,
    pub coin_payload: Vec<u8>,
}

impl UnitDraft {
    /// Sign the draft, producing a finished unit.
    pub fn sign(self, key: &KeyPair) -> Unit {
        let preamble = encode_preamble(
            self.creator,
            self.height,
            &self.parents,
            &self.txs,
            &self.coin_payload,
        );
        let signature = key.sign(&preamble);
        Unit::assemble(
            self.creator,
            self.height,
            self.parents,
            self.txs,
            self.coin_payload,
            signature,
        )
    }
}

impl Unit {
    fn assemble(
        creator: ProcessId,
        height: u64,
        parents: Vec<Hash>,
        txs: Vec<Transaction>,
        coin_payload: Vec<u8>,
        signature: Signature,
    ) -> Self {
        let mut bytes = encode_preamble(creator, height, &parents, &txs, &coin_payload);
        bytes.extend_from_slice(signature.as_bytes());
        let hash = Hash::digest(&bytes);
        Self {
            creator,
            height,
            parents,
            txs,
            coin_payload,
            signature,
            hash,
        }
    }

    /// The creating process.
    pub fn creator(&self) -> ProcessId {
        self.creator
    }

    /// Position in the creator's chain; 0 for a dealing unit.
    pub fn height(&self) -> u64 {
        self.height
    }

    /// Parent hashes; the first is the predecessor when present.
    pub fn parents(&self) -> &[Hash] {
        &self.parents
    }

    /// The creator's previous unit, if any.
    pub fn predecessor(&self) -> Option<&Hash> {
        self.parents.first()
    }

    /// Whether this is a dealing unit (no parents).
    pub fn is_dealing(&self) -> bool {
        self.parents.is_empty()
    }

    /// The transactions carried by this unit.
    pub fn txs(&self) -> &[Transaction] {
        &self.txs
    }

    /// The opaque coin payload.
    pub fn coin_payload(&self) -> &[u8] {
        &self.coin_payload
    }

    /// Parse the coin payload as a dealt threshold coin.
    pub fn dealt_coin(&self, n: usize) -> Result<DealtCoin, CoinError> {
        DealtCoin::decode(&self.coin_payload, n)
    }

    /// Parse the coin payload as a single coin share.
    pub fn coin_share(&self) -> Result<CoinShare, CoinError> {
        CoinShare::decode(&self.coin_payload)
    }

    /// The creator's signature.
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// The derived content hash.
    pub fn hash(&self) -> Hash {
        self.hash
    }

    /// Verify the creator's signature against `key`.
    pub fn verify_signature(&self, key: &PublicKey) -> bool {
        let preamble = encode_preamble(
            self.creator,
            self.height,
            &self.parents,
            &self.txs,
            &self.coin_payload,
        );
        key.verify(&preamble, &self.signature)
    }

    /// Serialize to the wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = encode_preamble(
            self.creator,
            self.height,
            &self.parents,
            &self.txs,
            &self.coin_payload,
        );
        bytes.extend_from_slice(self.signature.as_bytes());
        bytes
    }

    /// Parse a unit from its wire form, recomputing its hash.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut cursor = Cursor::new(bytes);

        let creator = ProcessId(cursor.u16()?);
        let height = cursor.u64()?;

        let parent_count = cursor.u32()? as usize;
        if parent_count > MAX_WIRE_PARENTS {
            return Err(WireError::TooManyParents(parent_count));
        }
        let mut parents = Vec::with_capacity(parent_count);
        for _ in 0..parent_count {
            parents.push(cursor.hash()?);
        }

        let tx_count = cursor.u32()? as usize;
        if tx_count > MAX_WIRE_TXS {
            return Err(WireError::TooManyTransactions(tx_count));
        }
        let mut txs = Vec::with_capacity(tx_count);
        for _ in 0..tx_count {
            let len = cursor.u32()? as usize;
            if len > MAX_WIRE_TX_BYTES {
                return Err(WireError::OversizedTransaction(len));
            }
            txs.push(Transaction::new(cursor.bytes(len)?.to_vec()));
        }

        let coin_len = cursor.u32()? as usize;
        if coin_len > MAX_WIRE_COIN_BYTES {
            return Err(WireError::OversizedCoinPayload(coin_len));
        }
        let coin_payload = cursor.bytes(coin_len)?.to_vec();

        let mut sig_bytes = [0u8; SIGNATURE_LENGTH];
        sig_bytes.copy_from_slice(cursor.bytes(SIGNATURE_LENGTH)?);
        let signature = Signature::from_bytes(sig_bytes);

        if !cursor.is_empty() {
            return Err(WireError::TrailingBytes(cursor.remaining()));
        }

        Ok(Unit::assemble(
            creator,
            height,
            parents,
            txs,
            coin_payload,
            signature,
        ))
    }
}

impl std::fmt::Debug for Unit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unit")
            .field("creator", &self.creator.0)
            .field("height", &self.height)
            .field("parents", &self.parents.len())
            .field("txs", &self.txs.len())
            .field("hash", &self.hash)
            .finish()
    }
}

fn encode_preamble(
    creator: ProcessId,
    height: u64,
    parents: &[Hash],
    txs: &[Transaction],
    coin_payload: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        2 + 8 + 4 + parents.len() * HASH_LENGTH + 4 + 4 + coin_payload.len(),
    );
    out.extend_from_slice(&creator.0.to_le_bytes());
    out.extend_from_slice(&height.to_le_bytes());
    out.extend_from_slice(&(parents.len() as u32).to_le_bytes());
    for parent in parents {
        out.extend_from_slice(parent.as_bytes());
    }
    out.extend_from_slice(&(txs.len() as u32).to_le_bytes());
    for tx in txs {
        out.extend_from_slice(&(tx.len() as u32).to_le_bytes());
        out.extend_from_slice(tx.as_bytes());
    }
    out.extend_from_slice(&(coin_payload.len() as u32).to_le_bytes());
    out.extend_from_slice(coin_payload);
    out
}

/// Errors parsing a unit's wire form.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("unexpected end of input")]
    Truncated,

    #[error("{0} trailing bytes after unit")]
    TrailingBytes(usize),

    #[error("parent count {0} exceeds wire limit")]
    TooManyParents(usize),

    #[error("transaction count {0} exceeds wire limit")]
    TooManyTransactions(usize),

    #[error("transaction of {0} bytes exceeds wire limit")]
    OversizedTransaction(usize),

    #[error("coin payload of {0} bytes exceeds wire limit")]
    OversizedCoinPayload(usize),
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        if self.pos + len > self.bytes.len() {
            return Err(WireError::Truncated);
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, WireError> {
        let b = self.bytes(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_le_bytes(buf))
    }

    fn hash(&mut self) -> Result<Hash, WireError> {
        let b = self.bytes(HASH_LENGTH)?;
        let mut buf = [0u8; HASH_LENGTH];
        buf.copy_from_slice(b);
        Ok(Hash::from_raw(buf))
    }

    fn is_empty(&self) -> bool {
        self.pos == self.bytes.len()
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }
}
