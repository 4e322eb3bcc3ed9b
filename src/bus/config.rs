//! Bus configuration.
//!
//! Settings come from environment variables (with defaults), or from a YAML
//! file with the same shape as [`BusConfig`]. Both paths go through
//! [`BusConfig::validate`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{BusError, Result};

/// Which backend the bus runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusMode {
    #[default]
    #[serde(alias = "live")]
    Kafka,
    Mock,
}

impl FromStr for BusMode {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "kafka" | "live" => Ok(BusMode::Kafka),
            "mock" => Ok(BusMode::Mock),
            other => Err(BusError::Config(format!(
                "MESSAGE_BUS_MODE must be 'kafka' or 'mock', got '{}'",
                other
            ))),
        }
    }
}

/// Whether a Kafka publish waits for the broker's delivery report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProduceAck {
    #[default]
    Acknowledged,
    FireAndForget,
}

impl FromStr for ProduceAck {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "acknowledged" | "ack" => Ok(ProduceAck::Acknowledged),
            "fire_and_forget" | "none" => Ok(ProduceAck::FireAndForget),
            other => Err(BusError::Config(format!(
                "KAFKA_PRODUCE_ACK must be 'acknowledged' or 'fire_and_forget', got '{}'",
                other
            ))),
        }
    }
}

/// SASL credentials; present only when both username and password are set
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaslSettings {
    pub mechanism: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for SaslSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaslSettings")
            .field("mechanism", &self.mechanism)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Live backend wiring
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KafkaSettings {
    pub bootstrap_servers: String,
    pub group_id: String,
    pub auto_offset_reset: String,
    pub security_protocol: Option<String>,
    pub sasl: Option<SaslSettings>,
    pub produce_ack: ProduceAck,
    pub send_timeout_ms: u64,
}

impl Default for KafkaSettings {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            group_id: "bridge-worker".to_string(),
            auto_offset_reset: "earliest".to_string(),
            security_protocol: None,
            sasl: None,
            produce_ack: ProduceAck::Acknowledged,
            send_timeout_ms: 5_000,
        }
    }
}

impl KafkaSettings {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

/// Process-wide bus configuration, immutable after construction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub mode: BusMode,
    pub input_topic: String,
    pub output_topic: String,
    /// Dead-letter topic for requests that exhausted retries or were rejected
    pub dlq_topic: Option<String>,
    pub kafka: KafkaSettings,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            mode: BusMode::Kafka,
            input_topic: "bridge-input".to_string(),
            output_topic: "bridge-output".to_string(),
            dlq_topic: None,
            kafka: KafkaSettings::default(),
        }
    }
}

impl BusConfig {
    /// Configuration for an in-memory bus with default topic names
    pub fn mock() -> Self {
        Self {
            mode: BusMode::Mock,
            ..Self::default()
        }
    }

    /// Read configuration from process environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary key lookup.
    ///
    /// Empty values are treated as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();
        let kafka_defaults = KafkaSettings::default();

        let mode = match get("MESSAGE_BUS_MODE") {
            Some(raw) => raw.parse::<BusMode>()?,
            None => defaults.mode,
        };

        let produce_ack = match get("KAFKA_PRODUCE_ACK") {
            Some(raw) => raw.parse::<ProduceAck>()?,
            None => kafka_defaults.produce_ack,
        };

        let send_timeout_ms = match get("KAFKA_SEND_TIMEOUT_MS") {
            Some(raw) => raw.parse::<u64>().map_err(|e| {
                BusError::Config(format!("KAFKA_SEND_TIMEOUT_MS is not a number: {}", e))
            })?,
            None => kafka_defaults.send_timeout_ms,
        };

        let (security_protocol, sasl) = resolve_auth(
            get("KAFKA_USERNAME"),
            get("KAFKA_PASSWORD"),
            get("KAFKA_SASL_MECHANISM"),
            get("KAFKA_SECURITY_PROTOCOL"),
        )?;

        let config = Self {
            mode,
            input_topic: get("KAFKA_INPUT_TOPIC").unwrap_or(defaults.input_topic),
            output_topic: get("KAFKA_OUTPUT_TOPIC").unwrap_or(defaults.output_topic),
            dlq_topic: get("KAFKA_DLQ_TOPIC"),
            kafka: KafkaSettings {
                bootstrap_servers: get("KAFKA_BOOTSTRAP_SERVERS")
                    .unwrap_or(kafka_defaults.bootstrap_servers),
                group_id: get("KAFKA_GROUP_ID").unwrap_or(kafka_defaults.group_id),
                auto_offset_reset: get("KAFKA_AUTO_OFFSET_RESET")
                    .unwrap_or(kafka_defaults.auto_offset_reset),
                security_protocol,
                sasl,
                produce_ack,
                send_timeout_ms,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file.
    ///
    /// # Example
    /// ```ignore
    /// use bus_bridge::BusConfig;
    ///
    /// let config = BusConfig::load_from_file("config/bus.yaml")?;
    /// println!("Consuming from {}", config.input_topic);
    /// ```
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let contents = fs::read_to_string(path).map_err(|e| {
            BusError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let config: BusConfig = serde_yaml::from_str(&contents)
            .map_err(|e| BusError::Config(format!("Failed to parse YAML: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_topic.trim().is_empty() || self.output_topic.trim().is_empty() {
            return Err(BusError::Config("topic names must not be empty".to_string()));
        }
        if self.input_topic == self.output_topic {
            return Err(BusError::Config(format!(
                "input and output topic are both '{}'",
                self.input_topic
            )));
        }
        if let Some(dlq) = &self.dlq_topic {
            if dlq == &self.input_topic || dlq == &self.output_topic {
                return Err(BusError::Config(format!(
                    "dead-letter topic '{}' collides with a data topic",
                    dlq
                )));
            }
        }
        if let Some(sasl) = &self.kafka.sasl {
            if sasl.username.is_empty() || sasl.password.is_empty() {
                return Err(BusError::Config(
                    "SASL username and password must both be non-empty".to_string(),
                ));
            }
        }
        if self.kafka.send_timeout_ms == 0 {
            return Err(BusError::Config("send timeout must be positive".to_string()));
        }
        Ok(())
    }
}

/// Credentials go together: both username and password, or neither.
/// A mechanism without credentials is rejected; a protocol alone (e.g. `SSL`)
/// is allowed.
fn resolve_auth(
    username: Option<String>,
    password: Option<String>,
    mechanism: Option<String>,
    protocol: Option<String>,
) -> Result<(Option<String>, Option<SaslSettings>)> {
    match (username, password) {
        (Some(username), Some(password)) => Ok((
            Some(protocol.unwrap_or_else(|| "SASL_SSL".to_string())),
            Some(SaslSettings {
                mechanism: mechanism.unwrap_or_else(|| "PLAIN".to_string()),
                username,
                password,
            }),
        )),
        (None, None) => {
            if mechanism.is_some() {
                return Err(BusError::Config(
                    "KAFKA_SASL_MECHANISM requires KAFKA_USERNAME and KAFKA_PASSWORD".to_string(),
                ));
            }
            Ok((protocol, None))
        }
        _ => Err(BusError::Config(
            "KAFKA_USERNAME and KAFKA_PASSWORD must be set together".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_from_empty_env() {
        let config = BusConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, BusConfig::default());
        assert_eq!(config.mode, BusMode::Kafka);
    }

    #[test]
    fn test_env_overrides() {
        let config = BusConfig::from_lookup(lookup(&[
            ("MESSAGE_BUS_MODE", "MOCK"),
            ("KAFKA_INPUT_TOPIC", "in"),
            ("KAFKA_OUTPUT_TOPIC", "out"),
            ("KAFKA_DLQ_TOPIC", "dead"),
            ("KAFKA_GROUP_ID", "g1"),
            ("KAFKA_PRODUCE_ACK", "fire-and-forget"),
            ("KAFKA_SEND_TIMEOUT_MS", "250"),
        ]))
        .unwrap();

        assert_eq!(config.mode, BusMode::Mock);
        assert_eq!(config.input_topic, "in");
        assert_eq!(config.output_topic, "out");
        assert_eq!(config.dlq_topic.as_deref(), Some("dead"));
        assert_eq!(config.kafka.group_id, "g1");
        assert_eq!(config.kafka.produce_ack, ProduceAck::FireAndForget);
        assert_eq!(config.kafka.send_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn test_unknown_mode_rejected() {
        let err = BusConfig::from_lookup(lookup(&[("MESSAGE_BUS_MODE", "redis")])).unwrap_err();
        assert!(matches!(err, BusError::Config(_)));
    }

    #[test]
    fn test_credentials_default_protocol_and_mechanism() {
        let config = BusConfig::from_lookup(lookup(&[
            ("KAFKA_USERNAME", "svc"),
            ("KAFKA_PASSWORD", "secret"),
        ]))
        .unwrap();

        let sasl = config.kafka.sasl.clone().unwrap();
        assert_eq!(sasl.mechanism, "PLAIN");
        assert_eq!(config.kafka.security_protocol.as_deref(), Some("SASL_SSL"));
        assert!(!format!("{:?}", config).contains("secret"));
    }

    #[test]
    fn test_partial_credentials_rejected() {
        assert!(BusConfig::from_lookup(lookup(&[("KAFKA_USERNAME", "svc")])).is_err());
        assert!(BusConfig::from_lookup(lookup(&[("KAFKA_PASSWORD", "x")])).is_err());
        assert!(BusConfig::from_lookup(lookup(&[("KAFKA_SASL_MECHANISM", "SCRAM-SHA-256")])).is_err());
    }

    #[test]
    fn test_protocol_alone_allowed() {
        let config =
            BusConfig::from_lookup(lookup(&[("KAFKA_SECURITY_PROTOCOL", "SSL")])).unwrap();
        assert_eq!(config.kafka.security_protocol.as_deref(), Some("SSL"));
        assert!(config.kafka.sasl.is_none());
    }

    #[test]
    fn test_same_input_and_output_topic_rejected() {
        let err = BusConfig::from_lookup(lookup(&[
            ("KAFKA_INPUT_TOPIC", "same"),
            ("KAFKA_OUTPUT_TOPIC", "same"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("same"));
    }

    #[test]
    fn test_load_from_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "mode: mock\ninput_topic: requests\noutput_topic: replies\nkafka:\n  group_id: yaml-group\n"
        )
        .unwrap();

        let config = BusConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.mode, BusMode::Mock);
        assert_eq!(config.input_topic, "requests");
        assert_eq!(config.kafka.group_id, "yaml-group");
        assert_eq!(config.kafka.bootstrap_servers, "localhost:9092");
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = BusConfig::load_from_file("/nonexistent/bus.yaml").unwrap_err();
        assert!(matches!(err, BusError::Config(_)));
    }
}
