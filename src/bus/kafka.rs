/// Kafka backend for the message bus
///
/// Publishes through a shared `FutureProducer` and consumes through one
/// `StreamConsumer` per subscription with manual offset commits.

use parking_lot::Mutex;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers as KafkaHeaders, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{Offset, TopicPartitionList};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use super::backoff::Backoff;
use super::config::{KafkaSettings, ProduceAck};
use super::envelope::{Envelope, Headers};
use super::offsets::OffsetTracker;
use super::{AckHandle, Delivery};
use crate::error::{BusError, Result};

const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);
const SEEK_TIMEOUT: Duration = Duration::from_secs(5);
const SUBSCRIBE_ATTEMPTS: u32 = 6;

#[derive(Clone)]
pub struct KafkaBackend {
    producer: FutureProducer,
    settings: KafkaSettings,
}

impl std::fmt::Debug for KafkaBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaBackend")
            .field("settings", &self.settings)
            .finish()
    }
}

impl KafkaBackend {
    /// Create the shared producer. No broker round trip happens here.
    pub fn connect(settings: KafkaSettings) -> Result<Self> {
        let producer: FutureProducer = client_config(&settings)
            .set("message.timeout.ms", settings.send_timeout_ms.to_string())
            .create()?;

        tracing::info!(
            "Kafka producer ready for {} (ack: {:?})",
            settings.bootstrap_servers,
            settings.produce_ack
        );

        Ok(Self { producer, settings })
    }

    pub async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<()> {
        let payload = encode_payload(envelope.payload())?;
        let headers = encode_headers(envelope.headers());

        let mut record: FutureRecord<'_, str, [u8]> = FutureRecord::to(topic)
            .payload(payload.as_slice())
            .headers(headers);
        if let Some(key) = envelope.partition_key() {
            record = record.key(key);
        }

        match self.settings.produce_ack {
            ProduceAck::Acknowledged => {
                let (partition, offset) = self
                    .producer
                    .send(record, self.settings.send_timeout())
                    .await
                    .map_err(|(e, _)| BusError::from(e))?;
                tracing::debug!(
                    "Published to {} [partition {} offset {}]",
                    topic,
                    partition,
                    offset
                );
            }
            ProduceAck::FireAndForget => {
                // The delivery future is dropped; the producer still delivers in the background
                let _delivery = self
                    .producer
                    .send_result(record)
                    .map_err(|(e, _)| BusError::from(e))?;
                tracing::debug!("Queued publish to {}", topic);
            }
        }

        Ok(())
    }

    /// Subscribe a fresh consumer in the configured group to `topic`
    pub async fn consume(&self, topic: &str) -> Result<KafkaSubscription> {
        let mut backoff = Backoff::default();

        loop {
            match self.subscribe(topic) {
                Ok(consumer) => {
                    tracing::info!(
                        "Subscribed to {} as group {}",
                        topic,
                        self.settings.group_id
                    );
                    return Ok(KafkaSubscription {
                        consumer: Arc::new(consumer),
                        tracker: Arc::new(Mutex::new(OffsetTracker::new())),
                        backoff: Backoff::default(),
                    });
                }
                Err(e) if backoff.attempts() + 1 < SUBSCRIBE_ATTEMPTS => {
                    tracing::warn!(
                        "Subscription to {} failed (attempt {}): {}",
                        topic,
                        backoff.attempts() + 1,
                        e
                    );
                    backoff.wait().await;
                }
                Err(e) => {
                    tracing::error!("Giving up on subscription to {}: {}", topic, e);
                    return Err(e);
                }
            }
        }
    }

    fn subscribe(&self, topic: &str) -> Result<StreamConsumer> {
        let consumer: StreamConsumer = client_config(&self.settings)
            .set("group.id", &self.settings.group_id)
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .set("auto.offset.reset", &self.settings.auto_offset_reset)
            .create()?;
        consumer.subscribe(&[topic])?;
        Ok(consumer)
    }

    /// Flush queued produce requests. The flush blocks, so it runs off the
    /// async executor.
    pub async fn close(&self) {
        let producer = self.producer.clone();
        match tokio::task::spawn_blocking(move || producer.flush(FLUSH_TIMEOUT)).await {
            Ok(Ok(())) => tracing::debug!("Kafka producer flushed"),
            Ok(Err(e)) => tracing::warn!("Kafka producer flush incomplete: {}", e),
            Err(e) => tracing::warn!("Kafka producer flush task failed: {}", e),
        }
    }
}

/// Transport and auth settings shared by producer and consumers
fn client_config(settings: &KafkaSettings) -> ClientConfig {
    let mut config = ClientConfig::new();
    config.set("bootstrap.servers", &settings.bootstrap_servers);

    if let Some(protocol) = &settings.security_protocol {
        config.set("security.protocol", protocol);
    }
    if let Some(sasl) = &settings.sasl {
        config
            .set("sasl.mechanism", &sasl.mechanism)
            .set("sasl.username", &sasl.username)
            .set("sasl.password", &sasl.password);
    }

    config
}

pub struct KafkaSubscription {
    consumer: Arc<StreamConsumer>,
    tracker: Arc<Mutex<OffsetTracker>>,
    backoff: Backoff,
}

impl KafkaSubscription {
    /// Wait for the next message. Receive errors are logged and retried.
    pub async fn next(&mut self) -> Option<Delivery> {
        loop {
            match self.consumer.recv().await {
                Ok(message) => {
                    self.backoff.reset();

                    let topic = message.topic().to_string();
                    let partition = message.partition();
                    let offset = message.offset();

                    let attempt = self.tracker.lock().begin(&topic, partition, offset);
                    let Some(attempt) = attempt else {
                        // Replayed by a rewind of an earlier offset
                        tracing::debug!(
                            "Skipping {} [partition {}] offset {}: already delivered",
                            topic,
                            partition,
                            offset
                        );
                        continue;
                    };

                    let headers = message
                        .headers()
                        .map(decode_headers)
                        .unwrap_or_default();
                    let payload = decode_payload(message.payload());

                    return Some(Delivery::new(
                        Envelope::new(payload, headers),
                        topic.clone(),
                        attempt,
                        AckHandle::Kafka(KafkaAck {
                            consumer: Arc::clone(&self.consumer),
                            tracker: Arc::clone(&self.tracker),
                            topic,
                            partition,
                            offset,
                        }),
                    ));
                }
                Err(e) => {
                    tracing::warn!(
                        "Kafka receive error (retry {}): {}",
                        self.backoff.attempts() + 1,
                        e
                    );
                    self.backoff.wait().await;
                }
            }
        }
    }
}

/// Acknowledgement handle for one consumed offset
pub(crate) struct KafkaAck {
    consumer: Arc<StreamConsumer>,
    tracker: Arc<Mutex<OffsetTracker>>,
    topic: String,
    partition: i32,
    offset: i64,
}

impl KafkaAck {
    /// Mark the offset done and commit the watermark if it moved
    pub(crate) fn ack(self) -> Result<()> {
        let position = self
            .tracker
            .lock()
            .complete(&self.topic, self.partition, self.offset);

        if let Some(position) = position {
            let mut list = TopicPartitionList::new();
            list.add_partition_offset(&self.topic, self.partition, Offset::Offset(position))?;
            self.consumer.commit(&list, CommitMode::Async)?;
            tracing::debug!(
                "Committed {} [partition {}] at {}",
                self.topic,
                self.partition,
                position
            );
        }

        Ok(())
    }

    /// Rewind the partition so the broker redelivers this offset. Later
    /// offsets read again by the rewind are skipped by the subscription.
    pub(crate) fn nack(self) -> Result<()> {
        self.tracker
            .lock()
            .nack(&self.topic, self.partition, self.offset);
        self.consumer.seek(
            &self.topic,
            self.partition,
            Offset::Offset(self.offset),
            SEEK_TIMEOUT,
        )?;
        tracing::debug!(
            "Rewound {} [partition {}] to {}",
            self.topic,
            self.partition,
            self.offset
        );
        Ok(())
    }
}

fn encode_payload(payload: &Value) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(payload)?)
}

/// Wire bytes to a payload value; text that is not JSON is kept as a string
fn decode_payload(bytes: Option<&[u8]>) -> Value {
    match bytes {
        None => Value::Null,
        Some(bytes) => {
            let text = String::from_utf8_lossy(bytes);
            serde_json::from_str(&text).unwrap_or_else(|_| Value::String(text.into_owned()))
        }
    }
}

fn encode_headers(headers: &Headers) -> OwnedHeaders {
    headers
        .iter()
        .fold(OwnedHeaders::new_with_capacity(headers.len()), |acc, (key, value)| {
            acc.insert(Header {
                key: key.as_str(),
                value: Some(value.as_str()),
            })
        })
}

fn decode_headers<H: KafkaHeaders + ?Sized>(native: &H) -> Headers {
    let mut headers = Headers::with_capacity(native.count());
    for idx in 0..native.count() {
        if let Some(header) = native.try_get(idx) {
            let value = header
                .value
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .unwrap_or_default();
            headers.insert(header.key.to_string(), value);
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::config::SaslSettings;
    use serde_json::json;

    #[test]
    fn test_payload_decoding() {
        assert_eq!(
            decode_payload(Some(br#"{"request_text":"hi"}"#)),
            json!({"request_text": "hi"})
        );
        assert_eq!(decode_payload(Some(b"not json")), json!("not json"));
        assert_eq!(decode_payload(None), Value::Null);
        // invalid UTF-8 is replaced, not rejected
        assert_eq!(decode_payload(Some(&[0x66, 0xff])), json!("f\u{fffd}"));
    }

    #[test]
    fn test_headers_keep_order_through_native_form() {
        let mut headers = Headers::new();
        headers.insert("request_id".to_string(), "r1".to_string());
        headers.insert("chat_id".to_string(), "c1".to_string());
        headers.insert("natal_chart".to_string(), r#"{"sun":"leo"}"#.to_string());

        let native = encode_headers(&headers);
        assert_eq!(native.count(), 3);
        assert_eq!(decode_headers(&native), headers);
    }

    #[test]
    fn test_client_config_carries_sasl() {
        let settings = KafkaSettings {
            security_protocol: Some("SASL_SSL".to_string()),
            sasl: Some(SaslSettings {
                mechanism: "SCRAM-SHA-256".to_string(),
                username: "svc".to_string(),
                password: "secret".to_string(),
            }),
            ..KafkaSettings::default()
        };

        let config = client_config(&settings);
        assert_eq!(config.get("bootstrap.servers"), Some("localhost:9092"));
        assert_eq!(config.get("security.protocol"), Some("SASL_SSL"));
        assert_eq!(config.get("sasl.mechanism"), Some("SCRAM-SHA-256"));
        assert_eq!(config.get("sasl.username"), Some("svc"));
    }

    #[tokio::test]
    async fn test_close_flushes_without_stalling_the_runtime() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        // Nothing listens here, so the queued record keeps the flush busy
        let backend = KafkaBackend::connect(KafkaSettings {
            bootstrap_servers: "127.0.0.1:1".to_string(),
            produce_ack: ProduceAck::FireAndForget,
            send_timeout_ms: 60_000,
            ..KafkaSettings::default()
        })
        .unwrap();
        backend
            .publish("unreachable", &Envelope::new(json!({"request_text": "x"}), Headers::new()))
            .await
            .unwrap();

        let ticks = Arc::new(AtomicUsize::new(0));
        let ticker = {
            let ticks = Arc::clone(&ticks);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    ticks.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        backend.close().await;
        ticker.abort();
        assert!(ticks.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn test_client_config_without_auth() {
        let config = client_config(&KafkaSettings::default());
        assert_eq!(config.get("security.protocol"), None);
        assert_eq!(config.get("sasl.mechanism"), None);
    }
}
