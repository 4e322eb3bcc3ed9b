/// Message envelope and correlation contract
///
/// Wraps a payload with ordered string headers, and extracts the typed
/// correlation data the worker threads through a request/response round trip.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{BusError, Result};

/// Ordered header mapping carried beside the payload
pub type Headers = IndexMap<String, String>;

/// Well-known header keys
pub mod keys {
    pub const REQUEST_ID: &str = "request_id";
    pub const BOT_ID: &str = "bot_id";
    pub const CHAT_ID: &str = "chat_id";
    pub const NATAL_CHART: &str = "natal_chart";

    /// Keys that must survive the round trip unchanged
    pub const CORRELATION: [&str; 3] = [REQUEST_ID, BOT_ID, CHAT_ID];

    /// Hyphenated spelling accepted from producers for `key`
    pub fn alias(key: &str) -> String {
        key.replace('_', "-")
    }
}

/// Unit of transport: payload plus headers.
///
/// Immutable once built; equality is structural over both parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    payload: Value,
    #[serde(default)]
    headers: Headers,
}

impl Envelope {
    /// Create a new envelope. Does not require correlation headers.
    pub fn new(payload: Value, headers: Headers) -> Self {
        Self { payload, headers }
    }

    /// Create an envelope that must carry a `request_id`.
    pub fn correlated(payload: Value, headers: Headers) -> Result<Self> {
        if header_value(&headers, keys::REQUEST_ID).is_none() {
            return Err(BusError::InvalidEnvelope {
                header: keys::REQUEST_ID,
            });
        }
        Ok(Self::new(payload, headers))
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Look up a header by canonical name, falling back to its hyphenated alias.
    pub fn header(&self, key: &str) -> Option<&str> {
        header_value(&self.headers, key)
    }

    /// Conversation id used as the partition key
    pub fn partition_key(&self) -> Option<&str> {
        self.header(keys::CHAT_ID)
    }

    pub fn into_parts(self) -> (Value, Headers) {
        (self.payload, self.headers)
    }
}

fn header_value<'a>(headers: &'a Headers, key: &str) -> Option<&'a str> {
    headers
        .get(key)
        .or_else(|| headers.get(&keys::alias(key)))
        .map(String::as_str)
        .filter(|v| !v.is_empty())
}

/// Generate a fresh request id for producers
pub fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Correlation data extracted once from an input envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correlation {
    pub request_id: String,
    pub bot_id: Option<String>,
    pub chat_id: Option<String>,
    /// Raw header value; opaque to the bus
    pub natal_chart: Option<String>,
}

impl Correlation {
    pub fn from_headers(headers: &Headers) -> Result<Self> {
        let request_id = header_value(headers, keys::REQUEST_ID)
            .ok_or(BusError::InvalidEnvelope {
                header: keys::REQUEST_ID,
            })?
            .to_string();

        Ok(Self {
            request_id,
            bot_id: header_value(headers, keys::BOT_ID).map(String::from),
            chat_id: header_value(headers, keys::CHAT_ID).map(String::from),
            natal_chart: header_value(headers, keys::NATAL_CHART).map(String::from),
        })
    }

    /// Key that orders work for one conversation; falls back to the request itself
    pub fn session_key(&self) -> &str {
        self.chat_id.as_deref().unwrap_or(&self.request_id)
    }

    /// Canonical correlation headers for an output envelope
    pub fn headers(&self) -> Headers {
        let mut headers = Headers::new();
        headers.insert(keys::REQUEST_ID.to_string(), self.request_id.clone());
        if let Some(bot_id) = &self.bot_id {
            headers.insert(keys::BOT_ID.to_string(), bot_id.clone());
        }
        if let Some(chat_id) = &self.chat_id {
            headers.insert(keys::CHAT_ID.to_string(), chat_id.clone());
        }
        headers
    }

    /// Build output headers from the input headers.
    ///
    /// Input headers are copied in order. Hyphenated correlation aliases are
    /// rewritten to the canonical key, and `overrides` may change any header
    /// except the correlation keys.
    pub fn propagate(&self, input: &Headers, overrides: &Headers) -> Headers {
        let mut out = Headers::with_capacity(input.len());
        for (key, value) in input {
            let canonical = keys::CORRELATION
                .iter()
                .chain(std::iter::once(&keys::NATAL_CHART))
                .find(|k| keys::alias(k) == *key)
                .map(|k| k.to_string())
                .unwrap_or_else(|| key.clone());
            out.entry(canonical).or_insert_with(|| value.clone());
        }

        for (key, value) in self.headers() {
            out.insert(key, value);
        }

        for (key, value) in overrides {
            if keys::CORRELATION.contains(&key.as_str()) {
                tracing::warn!(
                    "Ignoring pipeline override of correlation header '{}' for request {}",
                    key,
                    self.request_id
                );
                continue;
            }
            out.insert(key.clone(), value.clone());
        }

        out
    }
}

/// Input topic payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputPayload {
    pub request_text: String,
    /// Free-form client context passed through to the pipeline
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl InputPayload {
    pub fn new(request_text: impl Into<String>) -> Self {
        Self {
            request_text: request_text.into(),
            metadata: Map::new(),
        }
    }

    /// Extract request text from a structured payload.
    ///
    /// Accepts `{"request_text": ..}` (or the `message` / `payload` fields) and
    /// a bare JSON string. An object-valued `metadata` field is kept.
    pub fn from_value(value: &Value) -> Result<Self> {
        let (text, metadata) = match value {
            Value::String(s) => (Some(s.as_str()), None),
            Value::Object(map) => (
                ["request_text", "message", "payload"]
                    .iter()
                    .find_map(|field| map.get(*field).and_then(Value::as_str)),
                map.get("metadata").and_then(Value::as_object),
            ),
            _ => (None, None),
        };

        match text {
            Some(t) if !t.trim().is_empty() => Ok(Self {
                request_text: t.to_string(),
                metadata: metadata.cloned().unwrap_or_default(),
            }),
            _ => Err(BusError::MalformedRequest(
                "payload carries no request_text".to_string(),
            )),
        }
    }

    pub fn to_value(&self) -> Value {
        let mut value = serde_json::json!({ "request_text": self.request_text });
        if !self.metadata.is_empty() {
            value["metadata"] = Value::Object(self.metadata.clone());
        }
        value
    }
}

/// Output topic payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputPayload {
    pub response_text: String,
}

impl OutputPayload {
    pub fn to_value(&self) -> Value {
        serde_json::json!({ "response_text": self.response_text })
    }
}
