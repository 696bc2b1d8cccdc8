//! Pairwise sync sessions.
//!
//! The three-step protocol over one TCP stream:
//!
//! 1. initiator → responder: the initiator's poset summary
//! 2. responder → initiator: the responder's summary, then the units
//!    the initiator is missing, in topological order
//! 3. initiator → responder: the units the responder is missing
//!
//! Sessions never touch the state machine directly: summaries and
//! diffs come from [`PosetQuery`] messages the arbiter answers, and
//! received units go back over the bounded event channel, which also
//! provides backpressure against a fast sender. Each phase runs under
//! a wall-clock deadline.

use crate::codec::{read_frame, write_frame, CodecError, Frame};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use totem_core::Event;
use totem_messages::{PosetSummary, UnitBatch};
use totem_types::{ProcessId, Unit};

/// Peers whose current session was flagged for misbehavior by the
/// arbiter.
///
/// Sessions poll this between delivered units and abort; starting a
/// fresh session with a peer clears its flag, so the next gossip round
/// gets a clean slate.
#[derive(Clone, Default)]
pub struct SessionFlags(Arc<Mutex<HashSet<ProcessId>>>);

impl SessionFlags {
    /// Flag the peer's current session.
    pub fn flag(&self, peer: ProcessId) {
        self.lock().insert(peer);
    }

    /// Forgive the peer for a fresh session.
    pub fn clear(&self, peer: ProcessId) {
        self.lock().remove(&peer);
    }

    /// Whether the peer's current session is flagged.
    pub fn is_flagged(&self, peer: ProcessId) -> bool {
        self.lock().contains(&peer)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<ProcessId>> {
        self.0.lock().expect("session flags poisoned")
    }
}

/// Read requests a sync session sends to the arbiter loop.
#[derive(Debug)]
pub enum PosetQuery {
    /// The local poset summary.
    Summary {
        reply: oneshot::Sender<PosetSummary>,
    },
    /// The units a peer with the given summary is missing, in
    /// topological order.
    Diff {
        summary: PosetSummary,
        reply: oneshot::Sender<Vec<Unit>>,
    },
}

/// Errors terminating a sync session.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("{0} phase timed out")]
    Timeout(&'static str),

    #[error("unexpected {got} frame during {phase}")]
    UnexpectedFrame {
        phase: &'static str,
        got: &'static str,
    },

    #[error("peer summary describes {got} processes, expected {expected}")]
    SummarySize { expected: usize, got: usize },

    #[error("peer {0} flagged for misbehavior, session aborted")]
    PeerMisbehaving(ProcessId),

    #[error("arbiter is gone")]
    ArbiterGone,
}

/// Shared handles every session needs.
#[derive(Clone)]
pub struct SessionContext {
    /// Read-query channel into the arbiter loop.
    pub queries: mpsc::Sender<PosetQuery>,
    /// Event channel into the arbiter loop (bounded; backpressure).
    pub events: mpsc::Sender<Event>,
    /// Misbehavior flags set by the arbiter.
    pub flags: SessionFlags,
    /// Wall-clock deadline per protocol phase.
    pub phase_timeout: Duration,
    /// Committee size, for validating peer summaries.
    pub committee_size: usize,
}

impl SessionContext {
    async fn local_summary(&self) -> Result<PosetSummary, SyncError> {
        let (reply, answer) = oneshot::channel();
        self.queries
            .send(PosetQuery::Summary { reply })
            .await
            .map_err(|_| SyncError::ArbiterGone)?;
        answer.await.map_err(|_| SyncError::ArbiterGone)
    }

    async fn diff_for(&self, summary: PosetSummary) -> Result<Vec<Unit>, SyncError> {
        let (reply, answer) = oneshot::channel();
        self.queries
            .send(PosetQuery::Diff { summary, reply })
            .await
            .map_err(|_| SyncError::ArbiterGone)?;
        answer.await.map_err(|_| SyncError::ArbiterGone)
    }

    async fn deliver(&self, units: Vec<Unit>, source: Option<ProcessId>) -> Result<(), SyncError> {
        for unit in units {
            self.events
                .send(Event::UnitReceived {
                    unit: Box::new(unit),
                    source,
                })
                .await
                .map_err(|_| SyncError::ArbiterGone)?;
            // A unit delivered earlier in the batch may have been
            // non-compliant; the arbiter flags the peer and the rest of
            // the session is abandoned.
            if let Some(peer) = source {
                if self.flags.is_flagged(peer) {
                    return Err(SyncError::PeerMisbehaving(peer));
                }
            }
        }
        Ok(())
    }

    fn check_summary(&self, summary: &PosetSummary) -> Result<(), SyncError> {
        if summary.len() != self.committee_size {
            return Err(SyncError::SummarySize {
                expected: self.committee_size,
                got: summary.len(),
            });
        }
        Ok(())
    }
}

/// Run the initiator side of a sync session with `peer`.
pub async fn initiate(
    stream: TcpStream,
    peer: ProcessId,
    context: &SessionContext,
) -> Result<(), SyncError> {
    let (mut reader, mut writer) = stream.into_split();
    let deadline = context.phase_timeout;

    // Phase 1: our summary.
    let ours = context.local_summary().await?;
    timeout(deadline, write_frame(&mut writer, &Frame::Summary(ours)))
        .await
        .map_err(|_| SyncError::Timeout("send summary"))??;

    // Phase 2: their summary, then the units we are missing.
    let theirs = match timeout(deadline, read_frame(&mut reader))
        .await
        .map_err(|_| SyncError::Timeout("receive summary"))??
    {
        Frame::Summary(summary) => summary,
        other => {
            return Err(SyncError::UnexpectedFrame {
                phase: "receive summary",
                got: other.type_name(),
            })
        }
    };
    context.check_summary(&theirs)?;

    let batch = match timeout(deadline, read_frame(&mut reader))
        .await
        .map_err(|_| SyncError::Timeout("receive units"))??
    {
        Frame::Units(batch) => batch,
        other => {
            return Err(SyncError::UnexpectedFrame {
                phase: "receive units",
                got: other.type_name(),
            })
        }
    };
    tracing::debug!(peer = peer.0, received = batch.units.len(), "sync units received");
    context.deliver(batch.units, Some(peer)).await?;

    // Phase 3: the units they are missing.
    let to_send = context.diff_for(theirs).await?;
    tracing::debug!(peer = peer.0, sending = to_send.len(), "sync units sent");
    timeout(
        deadline,
        write_frame(&mut writer, &Frame::Units(UnitBatch::new(to_send))),
    )
    .await
    .map_err(|_| SyncError::Timeout("send units"))??;

    Ok(())
}

/// Run the responder side, after the listener read the opening frame.
pub async fn respond(
    stream: TcpStream,
    opening: Frame,
    context: &SessionContext,
) -> Result<(), SyncError> {
    match opening {
        // A pushed announcement: a one-frame session.
        Frame::Announce(announcement) => {
            context.deliver(vec![announcement.into_unit()], None).await
        }
        Frame::Summary(theirs) => respond_sync(stream, theirs, context).await,
        other => Err(SyncError::UnexpectedFrame {
            phase: "session opening",
            got: other.type_name(),
        }),
    }
}

async fn respond_sync(
    stream: TcpStream,
    theirs: PosetSummary,
    context: &SessionContext,
) -> Result<(), SyncError> {
    context.check_summary(&theirs)?;
    let (mut reader, mut writer) = stream.into_split();
    let deadline = context.phase_timeout;

    // Phase 2: our summary, then the units the initiator is missing.
    let ours = context.local_summary().await?;
    timeout(deadline, write_frame(&mut writer, &Frame::Summary(ours)))
        .await
        .map_err(|_| SyncError::Timeout("send summary"))??;
    let to_send = context.diff_for(theirs).await?;
    tracing::debug!(sending = to_send.len(), "sync units sent");
    timeout(
        deadline,
        write_frame(&mut writer, &Frame::Units(UnitBatch::new(to_send))),
    )
    .await
    .map_err(|_| SyncError::Timeout("send units"))??;

    // Phase 3: the units we are missing.
    let batch = match timeout(deadline, read_frame(&mut reader))
        .await
        .map_err(|_| SyncError::Timeout("receive units"))??
    {
        Frame::Units(batch) => batch,
        other => {
            return Err(SyncError::UnexpectedFrame {
                phase: "receive units",
                got: other.type_name(),
            })
        }
    };
    tracing::debug!(received = batch.units.len(), "sync units received");
    // Inbound sessions are unauthenticated at the transport level, so
    // no peer id is attached to the units.
    context.deliver(batch.units, None).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use totem_messages::{SummaryEntry, UnitAnnouncement};
    use totem_types::test_utils::test_keypair;
    use totem_types::{Hash, UnitDraft};

    fn context(
        committee_size: usize,
    ) -> (
        SessionContext,
        mpsc::Receiver<PosetQuery>,
        mpsc::Receiver<Event>,
    ) {
        let (query_tx, query_rx) = mpsc::channel(8);
        let (event_tx, event_rx) = mpsc::channel(64);
        (
            SessionContext {
                queries: query_tx,
                events: event_tx,
                flags: SessionFlags::default(),
                phase_timeout: Duration::from_secs(2),
                committee_size,
            },
            query_rx,
            event_rx,
        )
    }

    fn unit(creator: u16, height: u64, parents: Vec<Hash>) -> Unit {
        UnitDraft {
            creator: ProcessId(creator),
            height,
            parents,
            txs: vec![],
            coin_payload: vec![],
        }
        .sign(&test_keypair(creator as usize))
    }

    /// Serve canned answers for one side's queries.
    async fn answer_queries(
        mut queries: mpsc::Receiver<PosetQuery>,
        summary: PosetSummary,
        diff: Vec<Unit>,
    ) {
        while let Some(query) = queries.recv().await {
            match query {
                PosetQuery::Summary { reply } => {
                    let _ = reply.send(summary.clone());
                }
                PosetQuery::Diff { reply, .. } => {
                    let _ = reply.send(diff.clone());
                }
            }
        }
    }

    #[tokio::test]
    async fn full_session_transfers_both_ways() {
        let initiator_unit = unit(0, 0, vec![]);
        let responder_unit = unit(1, 0, vec![]);

        let initiator_summary = PosetSummary::new(vec![
            Some(SummaryEntry {
                height: 0,
                hash: initiator_unit.hash(),
            }),
            None,
        ]);
        let responder_summary = PosetSummary::new(vec![
            None,
            Some(SummaryEntry {
                height: 0,
                hash: responder_unit.hash(),
            }),
        ]);

        let (initiator_ctx, initiator_queries, mut initiator_events) = context(2);
        let (responder_ctx, responder_queries, mut responder_events) = context(2);
        tokio::spawn(answer_queries(
            initiator_queries,
            initiator_summary,
            vec![initiator_unit.clone()],
        ));
        tokio::spawn(answer_queries(
            responder_queries,
            responder_summary,
            vec![responder_unit.clone()],
        ));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let responder = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut stream = stream;
            let opening = read_frame(&mut stream).await.unwrap();
            respond(stream, opening, &responder_ctx).await
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        initiate(stream, ProcessId(1), &initiator_ctx)
            .await
            .unwrap();
        responder.await.unwrap().unwrap();

        // The initiator got the responder's unit with the peer id
        // attached; the responder got the initiator's without one.
        match initiator_events.recv().await.unwrap() {
            Event::UnitReceived { unit, source } => {
                assert_eq!(unit.hash(), responder_unit.hash());
                assert_eq!(source, Some(ProcessId(1)));
            }
            other => panic!("unexpected event {}", other.type_name()),
        }
        match responder_events.recv().await.unwrap() {
            Event::UnitReceived { unit, source } => {
                assert_eq!(unit.hash(), initiator_unit.hash());
                assert_eq!(source, None);
            }
            other => panic!("unexpected event {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn announcement_opening_is_a_one_frame_session() {
        let announced = unit(0, 0, vec![]);
        let (ctx, _queries, mut events) = context(2);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let responder = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let opening = read_frame(&mut stream).await.unwrap();
            respond(stream, opening, &ctx).await
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_frame(
            &mut stream,
            &Frame::Announce(UnitAnnouncement::new(announced.clone())),
        )
        .await
        .unwrap();
        responder.await.unwrap().unwrap();

        match events.recv().await.unwrap() {
            Event::UnitReceived { unit, source } => {
                assert_eq!(unit.hash(), announced.hash());
                assert_eq!(source, None);
            }
            other => panic!("unexpected event {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn wrong_summary_size_aborts() {
        let (ctx, _queries, _events) = context(4);
        let short = PosetSummary::new(vec![None, None]);
        assert!(matches!(
            ctx.check_summary(&short),
            Err(SyncError::SummarySize {
                expected: 4,
                got: 2
            })
        ));
    }
}
