//! # bus-bridge: correlated request/response over a message bus
//!
//! Clients publish a natural-language request on an input topic, tagged with
//! correlation headers. A worker consumes it, asks a processing pipeline for a
//! reply and publishes that reply on an output topic with the same headers.
//!
//! ## Features
//!
//! - **Two backends, one contract**: a live Kafka broker (feature `kafka`, on
//!   by default) or an in-memory mock with identical enqueue / consume /
//!   correlate semantics
//! - **Correlation discipline**: `request_id`, `bot_id` and `chat_id` survive
//!   the round trip unchanged; other headers are copied through
//! - **At-least-once worker**: acknowledge after publish, bounded redelivery of
//!   transient failures, optional dead-letter topic, per-session ordering
//!   under concurrency
//! - **Pluggable pipeline**: [`Pipeline`] trait with an echo pipeline and a
//!   retrieval pipeline over embedding, vector search and generation services
//!
//! ## Example
//!
//! ```ignore
//! use bus_bridge::{BusConfig, EchoPipeline, Headers, MessageBus, Worker, WorkerOptions};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! let bus = MessageBus::mock(BusConfig::mock())?;
//! let mut headers = Headers::new();
//! headers.insert("request_id".into(), "r1".into());
//! bus.enqueue_input(serde_json::json!({"request_text": "hello"}), headers).await?;
//!
//! let options = WorkerOptions { max_messages: Some(1), ..WorkerOptions::default() };
//! Worker::new(bus.clone(), Arc::new(EchoPipeline), options)
//!     .run(CancellationToken::new())
//!     .await?;
//!
//! let outputs = bus.get_topic_messages("bridge-output")?;
//! assert_eq!(outputs[0].value["response_text"], "echo: hello");
//! ```

pub mod bus;
pub mod error;
pub mod health;
pub mod pipeline;
pub mod worker;

pub use bus::{
    new_request_id, Backend, BusConfig, BusMode, Correlation, Delivery, Envelope, Headers,
    InputPayload, MessageBus, MockBackend, OutputPayload, Subscription, TopicMessage,
};
pub use error::{BusError, PipelineError, Result};
pub use pipeline::{
    EchoPipeline, Pipeline, PipelineRequest, PipelineResponse, RetrievalPipeline, SessionContext,
};
pub use worker::{DeadLetter, Outcome, StatsSnapshot, Worker, WorkerOptions, WorkerState, WorkerStats};
