//! Error types shared by the bus, the pipeline boundary and the worker.

use thiserror::Error;

/// Failure reported by the processing pipeline or one of its collaborators.
///
/// The variant is the pipeline's classification: the worker redelivers
/// `Transient` failures and drops `Rejected` ones.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("Transient pipeline failure: {0}")]
    Transient(String),

    #[error("Request rejected by pipeline: {0}")]
    Rejected(String),
}

impl PipelineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::Transient(_))
    }
}

/// Error type for bus and worker operations
#[derive(Error, Debug)]
pub enum BusError {
    /// Broker unreachable, disconnected or refused the write
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A correlation header required at this boundary is missing
    #[error("Invalid envelope: missing required header '{header}'")]
    InvalidEnvelope { header: &'static str },

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation is only available on the mock backend")]
    MockOnly,
}

impl BusError {
    /// Whether a worker should leave the input unacknowledged so it is redelivered.
    pub fn is_retryable(&self) -> bool {
        match self {
            BusError::Transport(_) => true,
            BusError::Pipeline(e) => e.is_retryable(),
            _ => false,
        }
    }
}

#[cfg(feature = "kafka")]
impl From<rdkafka::error::KafkaError> for BusError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        BusError::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BusError>;
