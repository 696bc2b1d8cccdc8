//! Unit announcements.

use crate::sync::Reader;
use crate::CodecError;
use totem_types::Unit;

/// Pushes a freshly created unit to peers so propagation does not wait
/// for the next gossip round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitAnnouncement {
    unit: Unit,
}

impl UnitAnnouncement {
    /// Announce a unit.
    pub fn new(unit: Unit) -> Self {
        Self { unit }
    }

    /// Get a reference to the announced unit.
    pub fn unit(&self) -> &Unit {
        &self.unit
    }

    /// Consume and return the announced unit.
    pub fn into_unit(self) -> Unit {
        self.unit
    }

    /// Serialize: the unit's wire form with a `u32` length prefix.
    pub fn encode(&self) -> Vec<u8> {
        let bytes = self.unit.encode();
        let mut out = Vec::with_capacity(4 + bytes.len());
        out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(&bytes);
        out
    }

    /// Parse a serialized announcement.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut cursor = Reader::new(bytes);
        let len = cursor.u32()? as usize;
        let unit = Unit::decode(cursor.bytes(len)?)?;
        cursor.finish()?;
        Ok(Self { unit })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use totem_types::test_utils::test_keypair;
    use totem_types::{ProcessId, UnitDraft};

    #[test]
    fn announcement_round_trip() {
        let unit = UnitDraft {
            creator: ProcessId(2),
            height: 0,
            parents: vec![],
            txs: vec![],
            coin_payload: vec![],
        }
        .sign(&test_keypair(2));
        let ann = UnitAnnouncement::new(unit.clone());
        let decoded = UnitAnnouncement::decode(&ann.encode()).unwrap();
        assert_eq!(decoded.unit().hash(), unit.hash());
    }
}
