use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Worker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    #[default]
    Idle,
    Consuming,
    Processing,
    Publishing,
    Stopped,
}

impl WorkerState {
    /// Subscribed and able to take work
    pub fn is_ready(self) -> bool {
        matches!(
            self,
            WorkerState::Consuming | WorkerState::Processing | WorkerState::Publishing
        )
    }
}

/// Live counters shared between the worker, its lanes and the health endpoint
#[derive(Debug, Default)]
pub struct WorkerStats {
    state: Mutex<WorkerState>,
    received: AtomicU64,
    published: AtomicU64,
    dropped: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    abandoned: AtomicU64,
    in_flight: AtomicUsize,
}

/// Point-in-time copy of [`WorkerStats`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub state: WorkerState,
    pub received: u64,
    pub published: u64,
    pub dropped: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    /// Left unsettled when the shutdown grace ran out
    pub abandoned: u64,
    pub in_flight: usize,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: WorkerState) {
        let mut current = self.state.lock();
        // Stopped is terminal
        if *current != WorkerState::Stopped || state == WorkerState::Stopped {
            *current = state;
        }
    }

    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_outcome(&self, outcome: super::Outcome) {
        let counter = match outcome {
            super::Outcome::Published => &self.published,
            super::Outcome::Dropped => &self.dropped,
            super::Outcome::Retried => &self.retried,
            super::Outcome::DeadLettered => &self.dead_lettered,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    /// An unsettled retry inside a session lane
    pub(crate) fn record_retry(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    /// Count everything still in flight as abandoned. Returns how many were.
    pub(crate) fn abandon_in_flight(&self) -> u64 {
        let abandoned = self.in_flight.swap(0, Ordering::Relaxed) as u64;
        self.abandoned.fetch_add(abandoned, Ordering::Relaxed);
        abandoned
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            state: self.state(),
            received: self.received.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }
}
