//! Timer management for the production runner.
//!
//! Each armed timer is a tokio task that sleeps and then delivers the
//! matching event to the arbiter loop. Re-arming a timer id replaces
//! the previous task.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use totem_core::{Event, TimerId};
use tracing::trace;

fn timer_event(id: TimerId) -> Event {
    match id {
        TimerId::Create => Event::CreateTimer,
        TimerId::Sync => Event::SyncTimer,
        TimerId::Cleanup => Event::CleanupTimer,
    }
}

/// Manages the node's timers.
pub struct TimerManager {
    timers: HashMap<TimerId, JoinHandle<()>>,
    event_tx: mpsc::Sender<Event>,
}

impl TimerManager {
    /// A manager delivering timer events over `event_tx`.
    pub fn new(event_tx: mpsc::Sender<Event>) -> Self {
        Self {
            timers: HashMap::new(),
            event_tx,
        }
    }

    /// Arm `id` to fire after `duration`, replacing any previous arming.
    pub fn set_timer(&mut self, id: TimerId, duration: Duration) {
        self.cancel_timer(id);
        let event_tx = self.event_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            trace!(?id, "timer fired");
            let _ = event_tx.send(timer_event(id)).await;
        });
        self.timers.insert(id, handle);
        trace!(?id, ?duration, "timer set");
    }

    /// Cancel `id`; a no-op if it is not armed or already fired.
    pub fn cancel_timer(&mut self, id: TimerId) {
        if let Some(handle) = self.timers.remove(&id) {
            handle.abort();
            trace!(?id, "timer cancelled");
        }
    }

    /// Cancel everything; called during shutdown.
    pub fn cancel_all(&mut self) {
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
    }

    /// Number of armed timers.
    pub fn active_count(&self) -> usize {
        self.timers.len()
    }
}

impl Drop for TimerManager {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
