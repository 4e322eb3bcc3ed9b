//! Processing pipeline boundary.
//!
//! The worker hands each well-formed request to a [`Pipeline`] and publishes
//! whatever text comes back. Pipelines classify their own failures through
//! [`PipelineError`].

pub mod retrieval;

pub use retrieval::{
    EmbeddingService, ResponseGenerator, RetrievalPipeline, ScoredDocument, VectorStore,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::bus::{Correlation, Headers, InputPayload};
use crate::error::PipelineError;

/// Conversation identity handed to the pipeline
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionContext {
    /// Taken from `bot_id`
    pub user_id: Option<String>,
    /// Taken from `chat_id`
    pub session_id: Option<String>,
    /// `natal_chart` header, parsed as JSON when it is JSON
    pub natal_chart: Option<Value>,
}

impl SessionContext {
    pub fn from_correlation(correlation: &Correlation) -> Self {
        Self {
            user_id: correlation.bot_id.clone(),
            session_id: correlation.chat_id.clone(),
            natal_chart: correlation.natal_chart.as_deref().map(|raw| {
                serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRequest {
    pub request_id: String,
    pub text: String,
    pub session: SessionContext,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl PipelineRequest {
    pub fn new(correlation: &Correlation, input: InputPayload) -> Self {
        Self {
            request_id: correlation.request_id.clone(),
            text: input.request_text,
            session: SessionContext::from_correlation(correlation),
            metadata: input.metadata,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineResponse {
    pub text: String,
    /// Extra or replacement output headers; correlation keys are not overridable
    #[serde(default)]
    pub headers: Headers,
}

impl PipelineResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            headers: Headers::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

#[async_trait]
pub trait Pipeline: Send + Sync {
    async fn respond(&self, request: &PipelineRequest) -> Result<PipelineResponse, PipelineError>;
}

/// Replies with the request text; used by `mock-run` and as a smoke-test pipeline
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoPipeline;

#[async_trait]
impl Pipeline for EchoPipeline {
    async fn respond(&self, request: &PipelineRequest) -> Result<PipelineResponse, PipelineError> {
        Ok(PipelineResponse::text(format!("echo: {}", request.text)))
    }
}
