//! Worker loop: consume requests, run the pipeline, publish correlated
//! responses.
//!
//! Delivery is at-least-once. An input envelope is acknowledged only after
//! its response was published, after it was found malformed, or after the
//! worker gave up on it. Transient failures are retried until
//! `max_deliveries` is reached: through redelivery when processing inline,
//! in place inside the session lane otherwise, so a session's later
//! envelopes never overtake a failing one.

mod dead_letter;
mod lanes;
mod stats;

pub use dead_letter::DeadLetter;
pub use stats::{StatsSnapshot, WorkerState, WorkerStats};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::bus::backoff::Backoff;
use crate::bus::{
    Correlation, Delivery, Envelope, InputPayload, MessageBus, OutputPayload, Subscription,
};
use crate::error::{BusError, Result};
use crate::pipeline::{Pipeline, PipelineRequest};
use lanes::SessionLanes;

const LANE_RETRY_INITIAL: Duration = Duration::from_millis(100);
const LANE_RETRY_MAX: Duration = Duration::from_secs(5);

/// Terminal or retry outcome of one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Response published, input acknowledged
    Published,
    /// Malformed input acknowledged without output
    Dropped,
    /// Input handed back for redelivery
    Retried,
    /// Given up: recorded on the dead-letter topic if one is configured, then acknowledged
    DeadLettered,
}

/// Result of one processing attempt
enum Step {
    Settled(Outcome),
    /// Failed with a retryable error and attempts remain
    Retry(Delivery),
}

impl Outcome {
    /// Whether the input will not be seen again
    pub fn is_terminal(self) -> bool {
        !matches!(self, Outcome::Retried)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOptions {
    /// Envelopes in flight at once; 1 processes strictly in arrival order
    pub concurrency: usize,
    /// Deliveries of one envelope before a transient failure is final
    pub max_deliveries: u32,
    pub shutdown_grace: Duration,
    /// Stop after this many envelopes reached a terminal outcome
    pub max_messages: Option<u64>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            max_deliveries: 3,
            shutdown_grace: Duration::from_secs(10),
            max_messages: None,
        }
    }
}

impl WorkerOptions {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn number<T: std::str::FromStr>(key: &str, raw: Option<String>, default: T) -> Result<T>
        where
            T::Err: std::fmt::Display,
        {
            match raw.filter(|v| !v.trim().is_empty()) {
                Some(raw) => raw
                    .trim()
                    .parse::<T>()
                    .map_err(|e| BusError::Config(format!("{} is not a valid number: {}", key, e))),
                None => Ok(default),
            }
        }

        let defaults = Self::default();
        let options = Self {
            concurrency: number(
                "WORKER_CONCURRENCY",
                lookup("WORKER_CONCURRENCY"),
                defaults.concurrency,
            )?,
            max_deliveries: number(
                "WORKER_MAX_DELIVERIES",
                lookup("WORKER_MAX_DELIVERIES"),
                defaults.max_deliveries,
            )?,
            shutdown_grace: Duration::from_millis(number(
                "WORKER_SHUTDOWN_GRACE_MS",
                lookup("WORKER_SHUTDOWN_GRACE_MS"),
                defaults.shutdown_grace.as_millis() as u64,
            )?),
            max_messages: None,
        };

        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(BusError::Config("worker concurrency must be at least 1".to_string()));
        }
        if self.max_deliveries == 0 {
            return Err(BusError::Config("max deliveries must be at least 1".to_string()));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct Worker {
    bus: MessageBus,
    pipeline: Arc<dyn Pipeline>,
    options: WorkerOptions,
    stats: Arc<WorkerStats>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("bus", &self.bus)
            .field("options", &self.options)
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

impl Worker {
    pub fn new(bus: MessageBus, pipeline: Arc<dyn Pipeline>, options: WorkerOptions) -> Self {
        Self {
            bus,
            pipeline,
            options,
            stats: Arc::new(WorkerStats::new()),
        }
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        Arc::clone(&self.stats)
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    /// Consume the input topic until `shutdown` fires, the subscription ends
    /// or `max_messages` is reached.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<StatsSnapshot> {
        self.options.validate()?;
        let config = self.bus.config();
        tracing::info!(
            "Worker starting | input={} output={} concurrency={}",
            config.input_topic,
            config.output_topic,
            self.options.concurrency
        );

        let mut subscription = match self.bus.consume_input().await {
            Ok(subscription) => subscription,
            Err(e) => {
                tracing::error!("Worker could not subscribe to {}: {}", config.input_topic, e);
                self.stats.set_state(WorkerState::Stopped);
                return Err(e);
            }
        };
        self.stats.set_state(WorkerState::Consuming);

        if self.options.concurrency <= 1 {
            self.run_inline(&mut subscription, &shutdown).await;
        } else {
            self.run_lanes(&mut subscription, &shutdown).await;
        }

        let abandoned = self.stats.abandon_in_flight();
        if abandoned > 0 {
            tracing::warn!("{} request(s) left unsettled for redelivery", abandoned);
        }

        self.stats.set_state(WorkerState::Stopped);
        let snapshot = self.stats.snapshot();
        tracing::info!(
            "Worker stopped | published={} dropped={} retried={} dead_lettered={} abandoned={}",
            snapshot.published,
            snapshot.dropped,
            snapshot.retried,
            snapshot.dead_lettered,
            snapshot.abandoned
        );
        Ok(snapshot)
    }

    fn limit_reached(&self, settled: u64) -> bool {
        self.options.max_messages.map_or(false, |max| settled >= max)
    }

    async fn run_inline(&self, subscription: &mut Subscription, shutdown: &CancellationToken) {
        let grace = self.options.shutdown_grace;
        let mut settled = 0u64;

        while !self.limit_reached(settled) {
            let delivery = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = subscription.next() => match next {
                    Some(delivery) => delivery,
                    None => {
                        tracing::info!("Input subscription ended");
                        break;
                    }
                },
            };

            self.stats.record_received();
            let outcome = tokio::select! {
                outcome = self.process(delivery) => outcome,
                _ = async {
                    shutdown.cancelled().await;
                    tokio::time::sleep(grace).await;
                } => {
                    // Left unacknowledged; counted as abandoned once the loop exits
                    tracing::warn!("Abandoning in-flight request after {:?} shutdown grace", grace);
                    break;
                }
            };

            self.stats.set_state(WorkerState::Consuming);
            if outcome.is_terminal() {
                settled += 1;
            }
        }

        if self.limit_reached(settled) {
            tracing::info!("Processed max_messages={}, stopping", settled);
        }
    }

    async fn run_lanes(&self, subscription: &mut Subscription, shutdown: &CancellationToken) {
        let permits = Arc::new(Semaphore::new(self.options.concurrency));
        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
        let mut lanes = SessionLanes::new(self.clone(), outcome_tx, shutdown.clone());

        let mut settled = 0u64;
        let mut pending = 0u64;

        while !self.limit_reached(settled) {
            // Envelopes in flight may all settle, so count them against the limit
            let can_read = !self.limit_reached(settled + pending);

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(outcome) = outcome_rx.recv() => {
                    pending = pending.saturating_sub(1);
                    if outcome.is_terminal() {
                        settled += 1;
                    }
                }
                next = next_with_permit(subscription, &permits), if can_read => match next {
                    Some((delivery, permit)) => {
                        self.stats.record_received();
                        pending += 1;
                        lanes.dispatch(delivery, permit);
                        tracing::debug!("{} envelope(s) in flight across {} lane(s)", pending, lanes.active());
                    }
                    None => {
                        tracing::info!("Input subscription ended");
                        break;
                    }
                },
            }
        }

        if self.limit_reached(settled) {
            tracing::info!("Processed max_messages={}, stopping", settled);
        }
        lanes.drain(self.options.shutdown_grace).await;
    }

    /// Run one delivery to its outcome and settle it with the backend. A
    /// retryable failure hands the delivery back for redelivery.
    pub async fn process(&self, delivery: Delivery) -> Outcome {
        self.stats.set_state(WorkerState::Processing);
        let attempt = delivery.attempt();
        let outcome = match self.handle(delivery, attempt).await {
            Step::Settled(outcome) => outcome,
            Step::Retry(delivery) => {
                self.nack(delivery).await;
                Outcome::Retried
            }
        };
        self.stats.record_outcome(outcome);
        outcome
    }

    /// Like [`Worker::process`], but retries in place with backoff so the
    /// caller's next envelope waits. The delivery is handed back only when
    /// `shutdown` fires during a retry wait.
    pub(crate) async fn process_in_place(
        &self,
        mut delivery: Delivery,
        shutdown: &CancellationToken,
    ) -> Outcome {
        self.stats.set_state(WorkerState::Processing);
        let mut attempt = delivery.attempt();
        let mut backoff = Backoff::new(LANE_RETRY_INITIAL, LANE_RETRY_MAX);

        let outcome = loop {
            match self.handle(delivery, attempt).await {
                Step::Settled(outcome) => break outcome,
                Step::Retry(failed) => {
                    let delay = backoff.next_delay();
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            self.nack(failed).await;
                            break Outcome::Retried;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    self.stats.record_retry();
                    self.stats.set_state(WorkerState::Processing);
                    attempt += 1;
                    delivery = failed;
                }
            }
        };

        self.stats.record_outcome(outcome);
        outcome
    }

    async fn handle(&self, delivery: Delivery, attempt: u32) -> Step {
        let (correlation, input) = match parse_request(delivery.envelope()) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(
                    "Dropping malformed envelope from {} (attempt {}): {}",
                    delivery.topic(),
                    attempt,
                    e
                );
                self.ack(delivery).await;
                return Step::Settled(Outcome::Dropped);
            }
        };

        let request = PipelineRequest::new(&correlation, input);
        let response = match self.pipeline.respond(&request).await {
            Ok(response) => response,
            Err(e) => {
                return self
                    .fail(delivery, attempt, &correlation, BusError::Pipeline(e))
                    .await
            }
        };

        self.stats.set_state(WorkerState::Publishing);
        let headers = correlation.propagate(delivery.envelope().headers(), &response.headers);
        let payload = OutputPayload {
            response_text: response.text,
        }
        .to_value();

        match self.bus.publish_output(payload, headers).await {
            Ok(()) => {
                tracing::info!("Published response for request {}", correlation.request_id);
                self.ack(delivery).await;
                Step::Settled(Outcome::Published)
            }
            Err(e) => self.fail(delivery, attempt, &correlation, e).await,
        }
    }

    async fn fail(
        &self,
        delivery: Delivery,
        attempt: u32,
        correlation: &Correlation,
        error: BusError,
    ) -> Step {
        if error.is_retryable() && attempt < self.options.max_deliveries {
            tracing::warn!(
                "Request {} failed on attempt {}/{}, retrying: {}",
                correlation.request_id,
                attempt,
                self.options.max_deliveries,
                error
            );
            return Step::Retry(delivery);
        }

        tracing::error!(
            "Request {} failed after {} attempt(s), giving up: {}",
            correlation.request_id,
            attempt,
            error
        );
        self.dead_letter(&delivery, attempt, &error).await;
        self.ack(delivery).await;
        Step::Settled(Outcome::DeadLettered)
    }

    async fn dead_letter(&self, delivery: &Delivery, attempt: u32, error: &BusError) {
        let Some(topic) = self.bus.config().dlq_topic.as_deref() else {
            return;
        };

        let published = match DeadLetter::from_delivery(delivery, error, attempt).to_envelope() {
            Ok(envelope) => self.bus.publish(topic, envelope).await,
            Err(e) => Err(e),
        };
        match published {
            Ok(()) => tracing::info!("Message routed to dead-letter topic {}", topic),
            Err(e) => tracing::error!("Failed to publish to dead-letter topic {}: {}", topic, e),
        }
    }

    async fn ack(&self, delivery: Delivery) {
        if let Err(e) = delivery.ack().await {
            tracing::error!("Failed to ACK message: {}", e);
        }
    }

    async fn nack(&self, delivery: Delivery) {
        if let Err(e) = delivery.nack().await {
            tracing::error!("Failed to NAK message: {}", e);
        }
    }
}

fn parse_request(envelope: &Envelope) -> Result<(Correlation, InputPayload)> {
    let correlation = Correlation::from_headers(envelope.headers())?;
    let input = InputPayload::from_value(envelope.payload())?;
    Ok((correlation, input))
}

async fn next_with_permit(
    subscription: &mut Subscription,
    permits: &Arc<Semaphore>,
) -> Option<(Delivery, OwnedSemaphorePermit)> {
    let permit = Arc::clone(permits).acquire_owned().await.ok()?;
    let delivery = subscription.next().await?;
    Some((delivery, permit))
}
