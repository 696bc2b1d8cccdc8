//! Sync handshake payloads.

use crate::{CodecError, MAX_BATCH_UNITS};
use totem_types::{Hash, ProcessId, Unit, HASH_LENGTH};

/// The tip a process knows for one creator: the height and hash of the
/// maximal unit it holds from that creator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SummaryEntry {
    pub height: u64,
    pub hash: Hash,
}

/// A compact description of a poset: per process, the maximal known
/// unit by that creator (or nothing if none is known).
///
/// Sent as the first frame of both sides of a sync session; each side
/// infers from the other's summary which units to ship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PosetSummary {
    entries: Vec<Option<SummaryEntry>>,
}

impl PosetSummary {
    /// Build from per-process tips in process-id order.
    pub fn new(entries: Vec<Option<SummaryEntry>>) -> Self {
        Self { entries }
    }

    /// Committee size this summary describes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the summary covers no processes.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The tip recorded for `pid`, if any.
    pub fn tip(&self, pid: ProcessId) -> Option<&SummaryEntry> {
        self.entries.get(pid.index()).and_then(|e| e.as_ref())
    }

    /// Iterate `(pid, tip)` pairs in process-id order.
    pub fn iter(&self) -> impl Iterator<Item = (ProcessId, Option<&SummaryEntry>)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, e)| (ProcessId(i as u16), e.as_ref()))
    }

    /// Serialize: `u16` count, then per process a `(creator, present,
    /// height, hash)` triple with height and hash omitted when absent.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.entries.len() * (2 + 1 + 8 + HASH_LENGTH));
        out.extend_from_slice(&(self.entries.len() as u16).to_le_bytes());
        for (pid, entry) in self.iter() {
            out.extend_from_slice(&pid.0.to_le_bytes());
            match entry {
                Some(tip) => {
                    out.push(1);
                    out.extend_from_slice(&tip.height.to_le_bytes());
                    out.extend_from_slice(tip.hash.as_bytes());
                }
                None => out.push(0),
            }
        }
        out
    }

    /// Parse a serialized summary.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut cursor = Reader::new(bytes);
        let count = cursor.u16()?;
        let mut entries = Vec::with_capacity(count as usize);
        for expected in 0..count {
            let creator = cursor.u16()?;
            if creator != expected {
                return Err(CodecError::SummaryOrder {
                    expected,
                    got: creator,
                });
            }
            let present = cursor.u8()?;
            if present == 0 {
                entries.push(None);
            } else {
                let height = cursor.u64()?;
                let hash = cursor.hash()?;
                entries.push(Some(SummaryEntry { height, hash }));
            }
        }
        cursor.finish()?;
        Ok(Self { entries })
    }
}

/// An ordered batch of serialized units.
///
/// Units appear in sender-topological order, so a receiver inserting
/// them in sequence always sees parents before children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitBatch {
    pub units: Vec<Unit>,
}

impl UnitBatch {
    /// Wrap units already in topological order.
    pub fn new(units: Vec<Unit>) -> Self {
        Self { units }
    }

    /// Serialize: `u32` count, then per unit a `u32` length prefix and
    /// the unit's wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.units.len() as u32).to_le_bytes());
        for unit in &self.units {
            let bytes = unit.encode();
            out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(&bytes);
        }
        out
    }

    /// Parse a serialized batch, validating every unit's wire form.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut cursor = Reader::new(bytes);
        let count = cursor.u32()? as usize;
        if count > MAX_BATCH_UNITS {
            return Err(CodecError::OversizedBatch(count));
        }
        let mut units = Vec::with_capacity(count);
        for _ in 0..count {
            let len = cursor.u32()? as usize;
            let unit_bytes = cursor.bytes(len)?;
            units.push(Unit::decode(unit_bytes)?);
        }
        cursor.finish()?;
        Ok(Self { units })
    }
}

pub(crate) struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub(crate) fn bytes(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        if self.pos + len > self.bytes.len() {
            return Err(CodecError::Truncated);
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.bytes(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16, CodecError> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, CodecError> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn u64(&mut self) -> Result<u64, CodecError> {
        let b = self.bytes(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_le_bytes(buf))
    }

    pub(crate) fn hash(&mut self) -> Result<Hash, CodecError> {
        let b = self.bytes(HASH_LENGTH)?;
        let mut buf = [0u8; HASH_LENGTH];
        buf.copy_from_slice(b);
        Ok(Hash::from_raw(buf))
    }

    pub(crate) fn finish(self) -> Result<(), CodecError> {
        if self.pos != self.bytes.len() {
            return Err(CodecError::TrailingBytes(self.bytes.len() - self.pos));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use totem_types::test_utils::{test_keypair, test_tx};
    use totem_types::UnitDraft;

    fn summary() -> PosetSummary {
        PosetSummary::new(vec![
            Some(SummaryEntry {
                height: 4,
                hash: Hash::digest(b"tip0"),
            }),
            None,
            Some(SummaryEntry {
                height: 0,
                hash: Hash::digest(b"tip2"),
            }),
            None,
        ])
    }

    #[test]
    fn summary_round_trip() {
        let s = summary();
        let decoded = PosetSummary::decode(&s.encode()).unwrap();
        assert_eq!(s, decoded);
        assert_eq!(decoded.tip(ProcessId(0)).unwrap().height, 4);
        assert!(decoded.tip(ProcessId(1)).is_none());
    }

    #[test]
    fn summary_rejects_out_of_order_entries() {
        let mut bytes = summary().encode();
        // Corrupt the second entry's creator id.
        bytes[2 + 2 + 1 + 8 + 32] ^= 1;
        assert!(matches!(
            PosetSummary::decode(&bytes),
            Err(CodecError::SummaryOrder { .. })
        ));
    }

    #[test]
    fn batch_round_trip() {
        let key = test_keypair(0);
        let unit = UnitDraft {
            creator: ProcessId(0),
            height: 0,
            parents: vec![],
            txs: vec![test_tx(1), test_tx(2)],
            coin_payload: vec![],
        }
        .sign(&key);
        let batch = UnitBatch::new(vec![unit.clone()]);
        let decoded = UnitBatch::decode(&batch.encode()).unwrap();
        assert_eq!(decoded.units.len(), 1);
        assert_eq!(decoded.units[0].hash(), unit.hash());
    }

    #[test]
    fn empty_batch_round_trip() {
        let batch = UnitBatch::new(vec![]);
        let decoded = UnitBatch::decode(&batch.encode()).unwrap();
        assert!(decoded.units.is_empty());
    }

    #[test]
    fn batch_rejects_garbage() {
        assert!(UnitBatch::decode(&[1, 2]).is_err());
    }
}
