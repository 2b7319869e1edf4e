use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use tokio::sync::broadcast;

use factory_types::{RunEvent, RunEventKind};

/// Events kept for late subscribers.
pub const REPLAY_CAPACITY: usize = 1000;
const CHANNEL_CAPACITY: usize = 2048;

struct BusState {
    next_seq: u64,
    history: VecDeque<RunEvent>,
}

/// Ordered publish/subscribe channel for one run.
///
/// Sequence assignment, history append and broadcast send happen under one
/// lock, so every subscriber observes events in emission order and a replay
/// snapshot never overlaps or skips the live stream.
pub struct EventBus {
    run_id: String,
    tx: broadcast::Sender<RunEvent>,
    state: Mutex<BusState>,
}

impl EventBus {
    pub fn new(run_id: impl Into<String>) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            run_id: run_id.into(),
            tx,
            state: Mutex::new(BusState {
                next_seq: 1,
                history: VecDeque::with_capacity(64),
            }),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }

    /// Snapshot of buffered history plus a receiver positioned right after it.
    pub fn subscribe_with_replay(&self) -> (Vec<RunEvent>, broadcast::Receiver<RunEvent>) {
        let state = self.lock();
        let rx = self.tx.subscribe();
        (state.history.iter().cloned().collect(), rx)
    }

    pub fn history(&self) -> Vec<RunEvent> {
        self.lock().history.iter().cloned().collect()
    }

    pub fn publish(&self, kind: RunEventKind) -> RunEvent {
        let mut state = self.lock();
        self.publish_locked(&mut state, kind)
    }

    /// Publish several events with no foreign event interleaved.
    pub fn publish_all(&self, kinds: Vec<RunEventKind>) -> Vec<RunEvent> {
        let mut state = self.lock();
        kinds
            .into_iter()
            .map(|kind| self.publish_locked(&mut state, kind))
            .collect()
    }

    fn publish_locked(&self, state: &mut BusState, kind: RunEventKind) -> RunEvent {
        let event = RunEvent {
            seq: state.next_seq,
            run_id: self.run_id.clone(),
            emitted_at: Utc::now(),
            kind,
        };
        state.next_seq += 1;
        if state.history.len() == REPLAY_CAPACITY {
            state.history.pop_front();
        }
        state.history.push_back(event.clone());
        // no receivers is fine
        let _ = self.tx.send(event.clone());
        event
    }
}
