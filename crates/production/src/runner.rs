//! The production runner: tokio I/O around the deterministic node.
//!
//! One event loop owns the [`NodeStateMachine`] and is the arbiter:
//! every poset mutation happens inside it. Everything else is tasks it
//! spawns (the sync/announcement listener, outbound sync sessions,
//! announcement pushes, timers, the transaction intake listener and a
//! blocking pool for signature verification), all of which talk back
//! exclusively through channels.

use crate::codec::{read_frame, write_frame, Frame};
use crate::intake::run_intake;
use crate::sync::{self, PosetQuery, SessionContext, SessionFlags};
use crate::timers::TimerManager;
use crate::ProductionConfig;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::time::timeout;
use totem_core::{Action, Event, OutboundMessage, StateMachine};
use totem_messages::UnitAnnouncement;
use totem_node::NodeStateMachine;
use totem_types::{Committee, KeyPair, OrderedBatch, ProcessId};
use tracing::{debug, error, info, trace, warn};

/// Fatal runner errors.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Hosts one committee member on tokio.
pub struct ProductionRunner {
    config: ProductionConfig,
    node: NodeStateMachine,
    event_tx: mpsc::Sender<Event>,
    event_rx: Option<mpsc::Receiver<Event>>,
    query_tx: mpsc::Sender<PosetQuery>,
    query_rx: Option<mpsc::Receiver<PosetQuery>>,
    /// Internal events jump the external queue to preserve causality.
    internal: VecDeque<Event>,
    timers: TimerManager,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    outgoing_syncs: Arc<Semaphore>,
    misbehavior: SessionFlags,
    /// External observer of the extending linear order.
    batches_tx: Option<mpsc::Sender<OrderedBatch>>,
    started: Instant,
}

impl ProductionRunner {
    /// Build a runner; `run` does the actual work.
    pub fn new(
        config: ProductionConfig,
        committee: Arc<Committee>,
        keypair: KeyPair,
    ) -> Result<Self, RunnerError> {
        if config.peers.len() != committee.size() {
            return Err(RunnerError::Config(format!(
                "{} peer addresses for a committee of {}",
                config.peers.len(),
                committee.size()
            )));
        }
        let (event_tx, event_rx) = mpsc::channel(config.node.event_queue_capacity);
        let (query_tx, query_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let seed = rand::random::<u64>();
        let node = NodeStateMachine::new(
            config.pid,
            keypair,
            committee,
            config.node.clone(),
            seed,
        );
        let outgoing_syncs = Arc::new(Semaphore::new(config.node.max_outgoing_syncs));
        Ok(Self {
            node,
            timers: TimerManager::new(event_tx.clone()),
            event_tx,
            event_rx: Some(event_rx),
            query_tx,
            query_rx: Some(query_rx),
            internal: VecDeque::new(),
            shutdown_tx,
            shutdown_rx,
            outgoing_syncs,
            misbehavior: SessionFlags::default(),
            batches_tx: None,
            started: Instant::now(),
            config,
        })
    }

    /// Subscribe to ordered batches; call before `run`.
    pub fn ordered_batches(&mut self) -> mpsc::Receiver<OrderedBatch> {
        let (tx, rx) = mpsc::channel(256);
        self.batches_tx = Some(tx);
        rx
    }

    /// A handle that makes `run` return.
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    /// Run until shutdown is requested or a fatal error occurs.
    pub async fn run(mut self) -> Result<(), RunnerError> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        info!(
            pid = self.config.pid.0,
            addr = ?listener.local_addr().ok(),
            "process listening"
        );
        tokio::spawn(run_listener(
            listener,
            self.session_context(),
            self.config.node.max_incoming_syncs,
            self.shutdown_rx.clone(),
        ));

        if let Some(addr) = self.config.intake_addr {
            let intake_listener = TcpListener::bind(addr).await?;
            tokio::spawn(run_intake(
                intake_listener,
                self.event_tx.clone(),
                self.shutdown_rx.clone(),
            ));
        }

        self.node.set_time(self.started.elapsed());
        let bootstrap_actions = self.node.bootstrap();
        self.execute_all(bootstrap_actions);

        let mut shutdown = self.shutdown_rx.clone();
        // The receivers leave `self` so the select arms borrow them
        // independently of the state machine.
        let mut event_rx = self.event_rx.take().expect("run called twice");
        let mut query_rx = self.query_rx.take().expect("run called twice");
        loop {
            // Internal events preserve causality over fresh input.
            while let Some(event) = self.internal.pop_front() {
                self.dispatch(event);
            }
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                Some(query) = query_rx.recv() => self.answer_query(query),
                Some(event) = event_rx.recv() => self.dispatch(event),
            }
        }

        info!(pid = self.config.pid.0, "shutting down");
        self.timers.cancel_all();
        Ok(())
    }

    fn session_context(&self) -> SessionContext {
        SessionContext {
            queries: self.query_tx.clone(),
            events: self.event_tx.clone(),
            flags: self.misbehavior.clone(),
            phase_timeout: self.config.node.sync_phase_timeout,
            committee_size: self.config.peers.len(),
        }
    }

    fn dispatch(&mut self, event: Event) {
        trace!(event = event.type_name(), "dispatching");
        self.node.set_time(self.started.elapsed());
        let actions = self.node.handle(event);
        self.execute_all(actions);
    }

    fn answer_query(&mut self, query: PosetQuery) {
        match query {
            PosetQuery::Summary { reply } => {
                let _ = reply.send(self.node.ordering().summary());
            }
            PosetQuery::Diff { summary, reply } => {
                let _ = reply.send(self.node.ordering().units_to_send(&summary));
            }
        }
    }

    fn execute_all(&mut self, actions: Vec<Action>) {
        for action in actions {
            self.execute(action);
        }
    }

    fn execute(&mut self, action: Action) {
        match action {
            Action::Broadcast { message } => self.broadcast(message),

            Action::StartSync { peer } => self.start_sync(peer),

            Action::SetTimer { id, duration } => self.timers.set_timer(id, duration),

            Action::CancelTimer { id } => self.timers.cancel_timer(id),

            Action::EnqueueInternal { event } => self.internal.push_back(event),

            Action::VerifyUnitSignature {
                unit,
                source,
                public_key,
            } => {
                let events = self.event_tx.clone();
                tokio::spawn(async move {
                    let checked = unit.clone();
                    let valid =
                        tokio::task::spawn_blocking(move || checked.verify_signature(&public_key))
                            .await
                            .unwrap_or(false);
                    let _ = events
                        .send(Event::UnitSignatureVerified {
                            unit,
                            source,
                            valid,
                        })
                        .await;
                });
            }

            Action::EmitOrderedBatch { batch } => {
                debug!(
                    round = batch.round,
                    units = batch.units.len(),
                    "ordered batch"
                );
                if let Some(tx) = &self.batches_tx {
                    if tx.try_send(batch).is_err() {
                        warn!("ordered-batch subscriber lagging, batch dropped");
                    }
                }
            }

            Action::ReportMisbehavior { peer, reason } => {
                warn!(peer = peer.0, %reason, "peer flagged for misbehavior");
                self.misbehavior.flag(peer);
            }

            Action::Shutdown { reason } => {
                error!(%reason, "fatal error, requesting shutdown");
                let _ = self.shutdown_tx.send(true);
            }
        }
    }

    /// Push a fresh unit to every peer, best effort.
    fn broadcast(&self, message: OutboundMessage) {
        let OutboundMessage::UnitAnnouncement(announcement) = message;
        let deadline = self.config.node.sync_phase_timeout;
        for (index, addr) in self.config.peers.iter().enumerate() {
            if index == self.config.pid.index() {
                continue;
            }
            let addr = *addr;
            let announcement = (*announcement).clone();
            tokio::spawn(async move {
                if let Err(error) = push_announcement(addr, announcement, deadline).await {
                    debug!(%addr, %error, "announcement push failed");
                }
            });
        }
    }

    /// Open an outbound sync session, respecting the concurrency cap.
    fn start_sync(&self, peer: ProcessId) {
        let Some(&addr) = self.config.peers.get(peer.index()) else {
            return;
        };
        let Ok(permit) = self.outgoing_syncs.clone().try_acquire_owned() else {
            trace!(peer = peer.0, "outgoing sync cap reached, skipping round");
            return;
        };
        // A new session gives the peer a clean slate.
        self.misbehavior.clear(peer);
        let context = self.session_context();
        let flags = self.misbehavior.clone();
        let deadline = self.config.node.sync_phase_timeout;
        tokio::spawn(async move {
            let _permit = permit;
            let connected = timeout(deadline, TcpStream::connect(addr)).await;
            let stream = match connected {
                Ok(Ok(stream)) => stream,
                Ok(Err(error)) => {
                    debug!(peer = peer.0, %error, "sync connect failed");
                    return;
                }
                Err(_) => {
                    debug!(peer = peer.0, "sync connect timed out");
                    return;
                }
            };
            match sync::initiate(stream, peer, &context).await {
                Ok(()) if flags.is_flagged(peer) => {
                    debug!(peer = peer.0, "session ended with peer flagged")
                }
                Ok(()) => trace!(peer = peer.0, "sync session complete"),
                Err(error) => debug!(peer = peer.0, %error, "sync session aborted"),
            }
        });
    }
}

/// Connect, push one announcement frame, close.
async fn push_announcement(
    addr: SocketAddr,
    announcement: UnitAnnouncement,
    deadline: Duration,
) -> Result<(), crate::codec::CodecError> {
    let stream = timeout(deadline, TcpStream::connect(addr))
        .await
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))??;
    let mut stream = stream;
    timeout(
        deadline,
        write_frame(&mut stream, &Frame::Announce(announcement)),
    )
    .await
    .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))?
}

/// Accept sync sessions and announcements until shutdown.
///
/// Sessions beyond the inbound cap are refused at accept time by
/// closing the connection immediately.
async fn run_listener(
    listener: TcpListener,
    context: SessionContext,
    max_incoming: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let incoming = Arc::new(Semaphore::new(max_incoming));
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(error) => {
                        warn!(%error, "accept failed");
                        continue;
                    }
                };
                let Ok(permit) = incoming.clone().try_acquire_owned() else {
                    debug!(%peer_addr, "inbound session refused, cap reached");
                    continue;
                };
                let context = context.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(error) = serve_session(stream, &context).await {
                        debug!(%peer_addr, %error, "inbound session aborted");
                    }
                });
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

async fn serve_session(
    mut stream: TcpStream,
    context: &SessionContext,
) -> Result<(), sync::SyncError> {
    let opening = timeout(context.phase_timeout, read_frame(&mut stream))
        .await
        .map_err(|_| sync::SyncError::Timeout("session opening"))??;
    sync::respond(stream, opening, context).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use totem_types::test_utils::test_committee;
    use totem_types::NodeConfig;

    fn local(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[tokio::test]
    async fn rejects_mismatched_peer_list() {
        let (committee, keys) = test_committee(4);
        let config = ProductionConfig {
            pid: ProcessId(0),
            listen_addr: local(0),
            peers: vec![local(0); 3],
            intake_addr: None,
            node: NodeConfig::default(),
        };
        let runner = ProductionRunner::new(config, Arc::new(committee), keys[0].clone());
        assert!(matches!(runner, Err(RunnerError::Config(_))));
    }

    #[tokio::test]
    async fn shutdown_handle_stops_the_runner() {
        let (committee, keys) = test_committee(4);
        let config = ProductionConfig {
            pid: ProcessId(0),
            listen_addr: local(0),
            peers: vec![local(1); 4],
            intake_addr: None,
            node: NodeConfig::default(),
        };
        let runner =
            ProductionRunner::new(config, Arc::new(committee), keys[0].clone()).unwrap();
        let shutdown = runner.shutdown_handle();
        let handle = tokio::spawn(runner.run());
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.send(true).unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("runner did not stop")
            .expect("runner task panicked");
        assert!(outcome.is_ok());
    }
}
