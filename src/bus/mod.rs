//! Message bus: envelopes, backends and the façade the worker talks to.
//!
//! The backend is chosen once from [`BusConfig::mode`]: a live Kafka broker or
//! an in-memory mock with the same enqueue / consume / correlate semantics.
//! Consumption yields [`Delivery`] values; only the worker settles them.

pub mod backoff;
pub mod config;
pub mod envelope;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod mock;
pub mod offsets;

pub use config::{BusConfig, BusMode, KafkaSettings, ProduceAck, SaslSettings};
pub use envelope::{keys, new_request_id, Correlation, Envelope, Headers, InputPayload, OutputPayload};
#[cfg(feature = "kafka")]
pub use kafka::{KafkaBackend, KafkaSubscription};
pub use mock::{MockBackend, MockSubscription, TopicMessage};

use serde_json::Value;

use crate::error::{BusError, Result};

/// The closed set of transports
#[derive(Debug, Clone)]
pub enum Backend {
    #[cfg(feature = "kafka")]
    Kafka(KafkaBackend),
    Mock(MockBackend),
}

impl Backend {
    pub fn name(&self) -> &'static str {
        match self {
            #[cfg(feature = "kafka")]
            Backend::Kafka(_) => "kafka",
            Backend::Mock(_) => "mock",
        }
    }

    pub async fn publish(&self, topic: &str, envelope: Envelope) -> Result<()> {
        match self {
            #[cfg(feature = "kafka")]
            Backend::Kafka(kafka) => kafka.publish(topic, &envelope).await,
            Backend::Mock(mock) => mock.publish(topic, envelope),
        }
    }

    pub async fn consume(&self, topic: &str) -> Result<Subscription> {
        match self {
            #[cfg(feature = "kafka")]
            Backend::Kafka(kafka) => Ok(Subscription::Kafka(kafka.consume(topic).await?)),
            Backend::Mock(mock) => Ok(Subscription::Mock(mock.consume(topic))),
        }
    }

    pub async fn close(&self) {
        match self {
            #[cfg(feature = "kafka")]
            Backend::Kafka(kafka) => kafka.close().await,
            Backend::Mock(mock) => mock.close(),
        }
    }
}

/// A stream of deliveries from one topic
pub enum Subscription {
    #[cfg(feature = "kafka")]
    Kafka(KafkaSubscription),
    Mock(MockSubscription),
}

impl Subscription {
    /// Next delivery, or `None` when the stream has ended
    pub async fn next(&mut self) -> Option<Delivery> {
        match self {
            #[cfg(feature = "kafka")]
            Subscription::Kafka(sub) => sub.next().await,
            Subscription::Mock(sub) => sub.next().await,
        }
    }
}

pub(crate) enum AckHandle {
    #[cfg(feature = "kafka")]
    Kafka(kafka::KafkaAck),
    Mock(mock::MockAck),
}

/// One consumed envelope awaiting a terminal outcome.
///
/// Settling consumes the delivery, so each one is acknowledged or negatively
/// acknowledged exactly once.
pub struct Delivery {
    envelope: Envelope,
    topic: String,
    attempt: u32,
    handle: AckHandle,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("topic", &self.topic)
            .field("attempt", &self.attempt)
            .field("envelope", &self.envelope)
            .finish()
    }
}

impl Delivery {
    pub(crate) fn new(envelope: Envelope, topic: String, attempt: u32, handle: AckHandle) -> Self {
        Self {
            envelope,
            topic,
            attempt,
            handle,
        }
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// 1-based delivery attempt for this envelope
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Mark the envelope processed; it will not be delivered again
    pub async fn ack(self) -> Result<()> {
        match self.handle {
            #[cfg(feature = "kafka")]
            AckHandle::Kafka(ack) => ack.ack(),
            AckHandle::Mock(ack) => {
                ack.ack();
                Ok(())
            }
        }
    }

    /// Hand the envelope back for redelivery
    pub async fn nack(self) -> Result<()> {
        match self.handle {
            #[cfg(feature = "kafka")]
            AckHandle::Kafka(ack) => ack.nack(),
            AckHandle::Mock(ack) => {
                ack.nack(self.envelope);
                Ok(())
            }
        }
    }
}

/// Backend-agnostic entry point for producers, the worker and tests
#[derive(Debug, Clone)]
pub struct MessageBus {
    config: BusConfig,
    backend: Backend,
}

impl MessageBus {
    /// Build the bus for `config.mode`
    pub fn new(config: BusConfig) -> Result<Self> {
        config.validate()?;

        let backend = match config.mode {
            BusMode::Mock => Backend::Mock(MockBackend::new()),
            #[cfg(feature = "kafka")]
            BusMode::Kafka => Backend::Kafka(KafkaBackend::connect(config.kafka.clone())?),
            #[cfg(not(feature = "kafka"))]
            BusMode::Kafka => {
                return Err(BusError::Config(
                    "Kafka mode requires the 'kafka' feature".to_string(),
                ))
            }
        };

        tracing::info!(
            "Message bus ready ({}): input '{}', output '{}'",
            backend.name(),
            config.input_topic,
            config.output_topic
        );

        Ok(Self { config, backend })
    }

    /// Build an in-memory bus regardless of `config.mode`
    pub fn mock(config: BusConfig) -> Result<Self> {
        Self::new(BusConfig {
            mode: BusMode::Mock,
            ..config
        })
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Publish a request on the input topic. `request_id` is not required here.
    pub async fn enqueue_input(&self, payload: Value, headers: Headers) -> Result<()> {
        self.publish(&self.config.input_topic, Envelope::new(payload, headers))
            .await
    }

    pub async fn consume_input(&self) -> Result<Subscription> {
        self.consume(&self.config.input_topic).await
    }

    /// Publish a response on the output topic; `request_id` must be present
    pub async fn publish_output(&self, payload: Value, headers: Headers) -> Result<()> {
        let envelope = Envelope::correlated(payload, headers)?;
        self.publish(&self.config.output_topic, envelope).await
    }

    pub async fn publish(&self, topic: &str, envelope: Envelope) -> Result<()> {
        self.backend.publish(topic, envelope).await
    }

    pub async fn consume(&self, topic: &str) -> Result<Subscription> {
        self.backend.consume(topic).await
    }

    /// The in-memory backend, when this bus runs on one
    pub fn mock_backend(&self) -> Option<&MockBackend> {
        match &self.backend {
            Backend::Mock(mock) => Some(mock),
            #[cfg(feature = "kafka")]
            _ => None,
        }
    }

    /// Inspect everything published to `topic`. Only the mock keeps history.
    pub fn get_topic_messages(&self, topic: &str) -> Result<Vec<TopicMessage>> {
        self.mock_backend()
            .map(|mock| mock.get_topic_messages(topic))
            .ok_or(BusError::MockOnly)
    }

    pub async fn close(&self) {
        self.backend.close().await;
        tracing::info!("Message bus closed");
    }
}
