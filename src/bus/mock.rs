//! In-memory bus backend for tests and local runs.
//!
//! Each [`MockBackend`] owns its own store, so independent test runs in one
//! process never see each other's topics. Every topic keeps two views:
//!
//! - **history**: every envelope ever published, for inspection
//! - **pending**: envelopes not yet delivered to a consumer, in FIFO order
//!
//! Consumption is single-consumer per topic; fan-out is not modelled.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Notify;

use super::envelope::{Envelope, Headers};
use super::Delivery;
use crate::error::{BusError, Result};

/// Inspection view of one published envelope
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopicMessage {
    pub value: Value,
    pub headers: Headers,
}

struct Pending {
    envelope: Envelope,
    /// Deliveries already made for this envelope
    delivered: u32,
}

#[derive(Default)]
struct MockStore {
    history: HashMap<String, Vec<Envelope>>,
    pending: HashMap<String, VecDeque<Pending>>,
    acked: HashMap<String, usize>,
    closed: bool,
}

#[derive(Default)]
struct MockInner {
    store: Mutex<MockStore>,
    arrivals: Notify,
}

#[derive(Clone, Default)]
pub struct MockBackend {
    inner: Arc<MockInner>,
}

impl std::fmt::Debug for MockBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let store = self.inner.store.lock();
        f.debug_struct("MockBackend")
            .field("topics", &store.history.keys().collect::<Vec<_>>())
            .field("closed", &store.closed)
            .finish()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an envelope to a topic and wake any waiting consumer
    pub fn publish(&self, topic: &str, envelope: Envelope) -> Result<()> {
        if topic.trim().is_empty() {
            return Err(BusError::Config("topic name must not be empty".to_string()));
        }

        {
            let mut store = self.inner.store.lock();
            store
                .history
                .entry(topic.to_string())
                .or_default()
                .push(envelope.clone());
            store
                .pending
                .entry(topic.to_string())
                .or_default()
                .push_back(Pending {
                    envelope,
                    delivered: 0,
                });
        }

        tracing::debug!("Mock publish to {}", topic);
        self.inner.arrivals.notify_waiters();
        Ok(())
    }

    pub fn consume(&self, topic: &str) -> MockSubscription {
        MockSubscription {
            backend: self.clone(),
            topic: topic.to_string(),
        }
    }

    /// Snapshot of every envelope ever published to `topic`, in publish order
    pub fn get_topic_messages(&self, topic: &str) -> Vec<TopicMessage> {
        let store = self.inner.store.lock();
        store
            .history
            .get(topic)
            .map(|envelopes| {
                envelopes
                    .iter()
                    .map(|e| TopicMessage {
                        value: e.payload().clone(),
                        headers: e.headers().clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Envelopes published to `topic` but not yet handed to a consumer
    pub fn pending_len(&self, topic: &str) -> usize {
        self.inner
            .store
            .lock()
            .pending
            .get(topic)
            .map_or(0, VecDeque::len)
    }

    /// Deliveries on `topic` that were acknowledged
    pub fn acknowledged(&self, topic: &str) -> usize {
        self.inner
            .store
            .lock()
            .acked
            .get(topic)
            .copied()
            .unwrap_or(0)
    }

    /// Drop all topics and reopen the backend
    pub fn reset(&self) {
        let mut store = self.inner.store.lock();
        *store = MockStore::default();
    }

    /// End all subscriptions once their pending queues are drained
    pub fn close(&self) {
        self.inner.store.lock().closed = true;
        self.inner.arrivals.notify_waiters();
    }

    fn take_next(&self, topic: &str) -> Option<Pending> {
        self.inner
            .store
            .lock()
            .pending
            .get_mut(topic)
            .and_then(VecDeque::pop_front)
    }

    fn is_closed(&self) -> bool {
        self.inner.store.lock().closed
    }

    fn requeue_front(&self, topic: &str, envelope: Envelope, delivered: u32) {
        {
            let mut store = self.inner.store.lock();
            store
                .pending
                .entry(topic.to_string())
                .or_default()
                .push_front(Pending {
                    envelope,
                    delivered,
                });
        }
        self.inner.arrivals.notify_waiters();
    }

    fn record_ack(&self, topic: &str) {
        *self
            .inner
            .store
            .lock()
            .acked
            .entry(topic.to_string())
            .or_insert(0) += 1;
    }
}

/// Single-consumer subscription over one mock topic
pub struct MockSubscription {
    backend: MockBackend,
    topic: String,
}

impl MockSubscription {
    /// Wait for the next pending envelope. Returns `None` once the backend is
    /// closed and the topic is drained.
    pub async fn next(&mut self) -> Option<Delivery> {
        loop {
            let arrival = self.backend.inner.arrivals.notified();
            tokio::pin!(arrival);
            // Register interest before checking so a publish in between is not missed
            arrival.as_mut().enable();

            if let Some(pending) = self.backend.take_next(&self.topic) {
                let attempt = pending.delivered + 1;
                return Some(Delivery::new(
                    pending.envelope,
                    self.topic.clone(),
                    attempt,
                    super::AckHandle::Mock(MockAck {
                        backend: self.backend.clone(),
                        topic: self.topic.clone(),
                        attempt,
                    }),
                ));
            }

            if self.backend.is_closed() {
                return None;
            }

            arrival.await;
        }
    }
}

/// Acknowledgement handle for a mock delivery
pub(crate) struct MockAck {
    backend: MockBackend,
    topic: String,
    attempt: u32,
}

impl MockAck {
    pub(crate) fn ack(self) {
        self.backend.record_ack(&self.topic);
    }

    /// Put the envelope back at the head of the queue for redelivery
    pub(crate) fn nack(self, envelope: Envelope) {
        self.backend.requeue_front(&self.topic, envelope, self.attempt);
    }
}
