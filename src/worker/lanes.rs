//! Per-session dispatch lanes.
//!
//! Envelopes of one session (same `chat_id`, else same `request_id`) run one
//! at a time in arrival order on a dedicated task; different sessions run
//! concurrently. A failing envelope is retried inside its lane before the
//! lane moves on. A lane lives while it has queued work and is pruned once it
//! drains.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::{Outcome, Worker};
use crate::bus::{keys, Delivery, Envelope};

type Work = (Delivery, OwnedSemaphorePermit);

struct Lane {
    sender: mpsc::UnboundedSender<Work>,
    queued: Arc<AtomicUsize>,
}

pub(crate) struct SessionLanes {
    worker: Worker,
    lanes: HashMap<String, Lane>,
    tasks: JoinSet<()>,
    outcomes: mpsc::UnboundedSender<Outcome>,
    shutdown: CancellationToken,
}

/// Ordering key for an envelope; unkeyed envelopes share one lane
pub(crate) fn session_key(envelope: &Envelope) -> String {
    envelope
        .partition_key()
        .or_else(|| envelope.header(keys::REQUEST_ID))
        .unwrap_or_default()
        .to_string()
}

impl SessionLanes {
    pub(crate) fn new(
        worker: Worker,
        outcomes: mpsc::UnboundedSender<Outcome>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            worker,
            lanes: HashMap::new(),
            tasks: JoinSet::new(),
            outcomes,
            shutdown,
        }
    }

    pub(crate) fn active(&self) -> usize {
        self.lanes.len()
    }

    /// Queue a delivery behind earlier work of the same session. The permit is
    /// released once the delivery is settled.
    pub(crate) fn dispatch(&mut self, delivery: Delivery, permit: OwnedSemaphorePermit) {
        self.reap();

        let key = session_key(delivery.envelope());
        let work = match self.send(&key, (delivery, permit)) {
            Ok(()) => return,
            Err(work) => work,
        };

        // The lane task is gone; start over with a fresh one
        tracing::error!("Lane for session '{}' exited unexpectedly, restarting", key);
        self.lanes.remove(&key);
        if self.send(&key, work).is_err() {
            tracing::error!("Dropping delivery for session '{}': lane unavailable", key);
        }
    }

    fn send(&mut self, key: &str, work: Work) -> Result<(), Work> {
        if !self.lanes.contains_key(key) {
            let lane = self.spawn_lane(key);
            self.lanes.insert(key.to_string(), lane);
        }

        let Some(lane) = self.lanes.get(key) else {
            return Err(work);
        };
        lane.queued.fetch_add(1, Ordering::SeqCst);
        lane.sender.send(work).map_err(|e| {
            lane.queued.fetch_sub(1, Ordering::SeqCst);
            e.0
        })
    }

    fn spawn_lane(&mut self, key: &str) -> Lane {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Work>();
        let queued = Arc::new(AtomicUsize::new(0));

        let worker = self.worker.clone();
        let outcomes = self.outcomes.clone();
        let shutdown = self.shutdown.clone();
        let lane_queued = Arc::clone(&queued);
        let session = key.to_string();

        self.tasks.spawn(async move {
            tracing::debug!("Lane opened for session '{}'", session);
            let mut handed_back = false;
            while let Some((delivery, permit)) = receiver.recv().await {
                if handed_back {
                    // Stays unsettled so it cannot overtake the envelope handed back before it
                    tracing::debug!("Leaving queued envelope of session '{}' unsettled", session);
                    drop(delivery);
                } else {
                    let outcome = worker.process_in_place(delivery, &shutdown).await;
                    handed_back = !outcome.is_terminal();
                    let _ = outcomes.send(outcome);
                }
                drop(permit);
                lane_queued.fetch_sub(1, Ordering::SeqCst);
            }
            tracing::debug!("Lane closed for session '{}'", session);
        });

        Lane { sender, queued }
    }

    /// Drop idle lanes and collect finished lane tasks
    fn reap(&mut self) {
        self.lanes
            .retain(|_, lane| lane.queued.load(Ordering::SeqCst) > 0);

        while let Some(result) = self.tasks.try_join_next() {
            if let Err(e) = result {
                tracing::error!("Lane task failed: {}", e);
            }
        }
    }

    /// Stop accepting work and give queued work `grace` to settle
    pub(crate) async fn drain(mut self, grace: Duration) {
        self.lanes.clear();

        let tasks = &mut self.tasks;
        let finished = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await
        .is_ok();

        if !finished {
            tracing::warn!(
                "Aborting {} lane(s) still busy after {:?} shutdown grace",
                self.tasks.len(),
                grace
            );
            self.tasks.shutdown().await;
        }
    }
}
