/// Dead-letter records for requests the worker gave up on

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bus::{Delivery, Envelope, Headers};

/// What was consumed, why it failed and how often it was tried
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Topic the envelope was consumed from
    pub topic: String,
    pub payload: Value,
    pub headers: Headers,
    pub error: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    /// `attempts` counts every try, including retries made without redelivery
    pub fn from_delivery(delivery: &Delivery, error: impl ToString, attempts: u32) -> Self {
        let envelope = delivery.envelope();
        Self {
            topic: delivery.topic().to_string(),
            payload: envelope.payload().clone(),
            headers: envelope.headers().clone(),
            error: error.to_string(),
            attempts,
            failed_at: Utc::now(),
        }
    }

    /// Envelope for the dead-letter topic; keeps the consumed headers so the
    /// record stays correlatable
    pub fn to_envelope(&self) -> crate::error::Result<Envelope> {
        Ok(Envelope::new(serde_json::to_value(self)?, self.headers.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MockBackend;
    use serde_json::json;

    #[tokio::test]
    async fn test_dead_letter_records_delivery() {
        let backend = MockBackend::new();
        let mut headers = Headers::new();
        headers.insert("request_id".to_string(), "r1".to_string());
        backend
            .publish("in", Envelope::new(json!({"request_text": "x"}), headers.clone()))
            .unwrap();

        let delivery = backend.consume("in").next().await.unwrap();
        let letter = DeadLetter::from_delivery(&delivery, "pipeline exploded", 3);
        assert_eq!(letter.topic, "in");
        assert_eq!(letter.attempts, 3);
        assert_eq!(letter.error, "pipeline exploded");

        let envelope = letter.to_envelope().unwrap();
        assert_eq!(envelope.headers(), &headers);
        assert_eq!(envelope.payload()["payload"], json!({"request_text": "x"}));
        assert!(envelope.payload()["failed_at"].is_string());
    }
}
