//! Frame encoding for the sync and announcement transport.
//!
//! # Wire Format
//!
//! ```text
//! [length: u32 LE][version: u8][kind: u8][payload]
//! ```
//!
//! - Version is currently `1`
//! - Kind selects the payload type: summary, unit batch or announcement
//! - Payloads are the `totem-messages` encodings

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use totem_messages::{PosetSummary, UnitAnnouncement, UnitBatch};

/// Current wire format version.
pub const WIRE_VERSION: u8 = 1;

/// Upper bound on a single frame's payload.
pub const MAX_FRAME_BYTES: usize = 32 << 20;

const KIND_SUMMARY: u8 = 1;
const KIND_UNITS: u8 = 2;
const KIND_ANNOUNCE: u8 = 3;

/// One transport frame.
#[derive(Debug, Clone)]
pub enum Frame {
    /// A poset summary, the opening frame of a sync session.
    Summary(PosetSummary),
    /// A batch of units in sender-topological order.
    Units(UnitBatch),
    /// A pushed announcement of a single fresh unit.
    Announce(UnitAnnouncement),
}

impl Frame {
    /// Get a human-readable name for this frame type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Frame::Summary(_) => "Summary",
            Frame::Units(_) => "Units",
            Frame::Announce(_) => "Announce",
        }
    }

    fn kind(&self) -> u8 {
        match self {
            Frame::Summary(_) => KIND_SUMMARY,
            Frame::Units(_) => KIND_UNITS,
            Frame::Announce(_) => KIND_ANNOUNCE,
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            Frame::Summary(summary) => summary.encode(),
            Frame::Units(batch) => batch.encode(),
            Frame::Announce(announcement) => announcement.encode(),
        }
    }
}

/// Errors reading or writing frames.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("unknown wire version: {0}")]
    UnknownVersion(u8),

    #[error("unknown frame kind: {0}")]
    UnknownKind(u8),

    #[error("frame of {0} bytes exceeds limit")]
    Oversized(usize),

    #[error("frame too short")]
    FrameTooShort,

    #[error("bad payload: {0}")]
    Payload(#[from] totem_messages::CodecError),
}

/// Write one length-prefixed frame and flush.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let payload = frame.payload();
    let mut bytes = Vec::with_capacity(2 + payload.len());
    bytes.push(WIRE_VERSION);
    bytes.push(frame.kind());
    bytes.extend_from_slice(&payload);
    if bytes.len() > MAX_FRAME_BYTES {
        return Err(CodecError::Oversized(bytes.len()));
    }
    writer.write_all(&(bytes.len() as u32).to_le_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut length_bytes = [0u8; 4];
    reader.read_exact(&mut length_bytes).await?;
    let length = u32::from_le_bytes(length_bytes) as usize;
    if length > MAX_FRAME_BYTES {
        return Err(CodecError::Oversized(length));
    }
    if length < 2 {
        return Err(CodecError::FrameTooShort);
    }
    let mut bytes = vec![0u8; length];
    reader.read_exact(&mut bytes).await?;

    let version = bytes[0];
    if version != WIRE_VERSION {
        return Err(CodecError::UnknownVersion(version));
    }
    let payload = &bytes[2..];
    match bytes[1] {
        KIND_SUMMARY => Ok(Frame::Summary(PosetSummary::decode(payload)?)),
        KIND_UNITS => Ok(Frame::Units(UnitBatch::decode(payload)?)),
        KIND_ANNOUNCE => Ok(Frame::Announce(UnitAnnouncement::decode(payload)?)),
        kind => Err(CodecError::UnknownKind(kind)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use totem_messages::SummaryEntry;
    use totem_types::test_utils::test_keypair;
    use totem_types::{Hash, ProcessId, UnitDraft};

    fn test_unit() -> totem_types::Unit {
        UnitDraft {
            creator: ProcessId(1),
            height: 0,
            parents: vec![],
            txs: vec![],
            coin_payload: vec![],
        }
        .sign(&test_keypair(1))
    }

    #[tokio::test]
    async fn summary_frame_round_trip() {
        let summary = PosetSummary::new(vec![
            Some(SummaryEntry {
                height: 3,
                hash: Hash::digest(b"tip"),
            }),
            None,
        ]);
        let (mut a, mut b) = tokio::io::duplex(4096);
        write_frame(&mut a, &Frame::Summary(summary.clone()))
            .await
            .unwrap();
        match read_frame(&mut b).await.unwrap() {
            Frame::Summary(decoded) => assert_eq!(decoded, summary),
            other => panic!("expected summary, got {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn unit_frames_round_trip() {
        let unit = test_unit();
        let (mut a, mut b) = tokio::io::duplex(65536);
        write_frame(&mut a, &Frame::Units(UnitBatch::new(vec![unit.clone()])))
            .await
            .unwrap();
        write_frame(&mut a, &Frame::Announce(UnitAnnouncement::new(unit.clone())))
            .await
            .unwrap();

        match read_frame(&mut b).await.unwrap() {
            Frame::Units(batch) => assert_eq!(batch.units[0].hash(), unit.hash()),
            other => panic!("expected units, got {}", other.type_name()),
        }
        match read_frame(&mut b).await.unwrap() {
            Frame::Announce(announcement) => assert_eq!(announcement.unit().hash(), unit.hash()),
            other => panic!("expected announce, got {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn unknown_version_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        tokio::io::AsyncWriteExt::write_all(&mut a, &3u32.to_le_bytes())
            .await
            .unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut a, &[99u8, KIND_SUMMARY, 0])
            .await
            .unwrap();
        assert!(matches!(
            read_frame(&mut b).await,
            Err(CodecError::UnknownVersion(99))
        ));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        tokio::io::AsyncWriteExt::write_all(&mut a, &(u32::MAX).to_le_bytes())
            .await
            .unwrap();
        assert!(matches!(
            read_frame(&mut b).await,
            Err(CodecError::Oversized(_))
        ));
    }
}
