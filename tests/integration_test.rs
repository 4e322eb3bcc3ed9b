//! Integration tests for the mock bus and the worker loop

use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use bus_bridge::{
    BusConfig, EchoPipeline, Headers, MessageBus, Pipeline, PipelineError, PipelineRequest,
    PipelineResponse, Worker, WorkerOptions, WorkerState,
};

fn headers(pairs: &[(&str, &str)]) -> Headers {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn mock_bus() -> MessageBus {
    MessageBus::mock(BusConfig::mock()).unwrap()
}

fn options(max_messages: u64) -> WorkerOptions {
    WorkerOptions {
        max_messages: Some(max_messages),
        shutdown_grace: Duration::from_millis(500),
        ..WorkerOptions::default()
    }
}

async fn run_worker(bus: &MessageBus, pipeline: Arc<dyn Pipeline>, options: WorkerOptions) -> Worker {
    let worker = Worker::new(bus.clone(), pipeline, options);
    tokio::time::timeout(Duration::from_secs(5), worker.run(CancellationToken::new()))
        .await
        .expect("worker did not stop")
        .unwrap();
    worker
}

/// Fails transiently a fixed number of times, then echoes
struct Flaky {
    failures_left: AtomicUsize,
    calls: AtomicUsize,
}

impl Flaky {
    fn new(failures: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(failures),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Pipeline for Flaky {
    async fn respond(&self, request: &PipelineRequest) -> Result<PipelineResponse, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_left.store(remaining - 1, Ordering::SeqCst);
            return Err(PipelineError::Transient("model warming up".to_string()));
        }
        Ok(PipelineResponse::text(format!("echo: {}", request.text)))
    }
}

struct Rejecting;

#[async_trait]
impl Pipeline for Rejecting {
    async fn respond(&self, _request: &PipelineRequest) -> Result<PipelineResponse, PipelineError> {
        Err(PipelineError::Rejected("unsupported language".to_string()))
    }
}

/// Tries to rewrite a correlation header and adds one of its own
struct Rewriting;

#[async_trait]
impl Pipeline for Rewriting {
    async fn respond(&self, request: &PipelineRequest) -> Result<PipelineResponse, PipelineError> {
        Ok(PipelineResponse::text(request.text.to_uppercase())
            .with_header("chat_id", "other-chat")
            .with_header("model", "small"))
    }
}

#[tokio::test]
async fn test_echo_round_trip() {
    let bus = mock_bus();
    let input_headers = headers(&[("request_id", "r1"), ("bot_id", "b1"), ("chat_id", "c1")]);
    bus.enqueue_input(json!({"request_text": "hello"}), input_headers.clone())
        .await
        .unwrap();

    let worker = run_worker(&bus, Arc::new(EchoPipeline), options(1)).await;

    let outputs = bus.get_topic_messages("bridge-output").unwrap();
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].value, json!({"response_text": "echo: hello"}));
    assert_eq!(outputs[0].headers, input_headers);

    let stats = worker.stats().snapshot();
    assert_eq!(stats.state, WorkerState::Stopped);
    assert_eq!(stats.published, 1);
    assert_eq!(stats.in_flight, 0);
}

#[tokio::test]
async fn test_missing_request_id_produces_no_output() {
    let bus = mock_bus();
    bus.enqueue_input(
        json!({"request_text": "hello"}),
        headers(&[("bot_id", "b1"), ("chat_id", "c1")]),
    )
    .await
    .unwrap();

    let worker = run_worker(&bus, Arc::new(EchoPipeline), options(1)).await;

    assert!(bus.get_topic_messages("bridge-output").unwrap().is_empty());
    assert_eq!(worker.stats().snapshot().dropped, 1);
    // poison input is acknowledged, not redelivered
    let mock = bus.mock_backend().unwrap();
    assert_eq!(mock.acknowledged("bridge-input"), 1);
    assert_eq!(mock.pending_len("bridge-input"), 0);
}

#[tokio::test]
async fn test_poison_message_does_not_block_neighbours() {
    let bus = mock_bus();
    bus.enqueue_input(json!({"request_text": "first"}), headers(&[("request_id", "r1")]))
        .await
        .unwrap();
    bus.enqueue_input(json!({"no_text": true}), headers(&[("request_id", "r2")]))
        .await
        .unwrap();
    bus.enqueue_input(json!({"request_text": "third"}), headers(&[("request_id", "r3")]))
        .await
        .unwrap();

    let worker = run_worker(&bus, Arc::new(EchoPipeline), options(3)).await;

    let outputs = bus.get_topic_messages("bridge-output").unwrap();
    let ids: Vec<_> = outputs.iter().map(|o| o.headers["request_id"].as_str()).collect();
    assert_eq!(ids, vec!["r1", "r3"]);
    assert_eq!(worker.stats().snapshot().dropped, 1);
}

#[tokio::test]
async fn test_headers_survive_and_aliases_are_canonicalised() {
    let bus = mock_bus();
    bus.enqueue_input(
        json!({"request_text": "hi"}),
        headers(&[
            ("traceparent", "00-abc-01"),
            ("request-id", "r7"),
            ("bot-id", "b7"),
            ("chat_id", "c7"),
            ("natal_chart", r#"{"sun":"leo"}"#),
        ]),
    )
    .await
    .unwrap();

    run_worker(&bus, Arc::new(Rewriting), options(1)).await;

    let outputs = bus.get_topic_messages("bridge-output").unwrap();
    assert_eq!(outputs.len(), 1);
    let out = &outputs[0].headers;
    assert_eq!(out["traceparent"], "00-abc-01");
    assert_eq!(out["request_id"], "r7");
    assert_eq!(out["bot_id"], "b7");
    assert_eq!(out["chat_id"], "c7");
    assert_eq!(out["natal_chart"], r#"{"sun":"leo"}"#);
    assert_eq!(out["model"], "small");
    assert!(!out.contains_key("request-id"));
    assert_eq!(outputs[0].value["response_text"], "HI");
}

#[tokio::test]
async fn test_transient_failure_is_redelivered_then_published() {
    let bus = mock_bus();
    bus.enqueue_input(json!({"request_text": "retry me"}), headers(&[("request_id", "r1")]))
        .await
        .unwrap();

    let pipeline = Arc::new(Flaky::new(2));
    let worker = run_worker(&bus, pipeline.clone(), options(1)).await;

    assert_eq!(pipeline.calls.load(Ordering::SeqCst), 3);
    let outputs = bus.get_topic_messages("bridge-output").unwrap();
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].value["response_text"], "echo: retry me");

    let stats = worker.stats().snapshot();
    assert_eq!(stats.retried, 2);
    assert_eq!(stats.published, 1);
}

#[tokio::test]
async fn test_exhausted_retries_go_to_dead_letter_topic() {
    let bus = MessageBus::mock(BusConfig {
        dlq_topic: Some("bridge-dlq".to_string()),
        ..BusConfig::mock()
    })
    .unwrap();
    let input_headers = headers(&[("request_id", "r1"), ("chat_id", "c1")]);
    bus.enqueue_input(json!({"request_text": "doomed"}), input_headers.clone())
        .await
        .unwrap();

    let pipeline = Arc::new(Flaky::new(usize::MAX));
    let worker = run_worker(&bus, pipeline.clone(), options(1)).await;

    assert_eq!(pipeline.calls.load(Ordering::SeqCst), 3);
    assert!(bus.get_topic_messages("bridge-output").unwrap().is_empty());

    let letters = bus.get_topic_messages("bridge-dlq").unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].headers, input_headers);
    assert_eq!(letters[0].value["topic"], "bridge-input");
    assert_eq!(letters[0].value["attempts"], 3);
    assert_eq!(letters[0].value["payload"], json!({"request_text": "doomed"}));

    assert_eq!(worker.stats().snapshot().dead_lettered, 1);
    assert_eq!(bus.mock_backend().unwrap().pending_len("bridge-input"), 0);
}

#[tokio::test]
async fn test_rejected_request_is_not_retried() {
    let bus = mock_bus();
    bus.enqueue_input(json!({"request_text": "nope"}), headers(&[("request_id", "r1")]))
        .await
        .unwrap();

    let worker = run_worker(&bus, Arc::new(Rejecting), options(1)).await;

    // no dead-letter topic configured: silent drop on the output side
    assert!(bus.get_topic_messages("bridge-output").unwrap().is_empty());
    let stats = worker.stats().snapshot();
    assert_eq!(stats.retried, 0);
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(bus.mock_backend().unwrap().acknowledged("bridge-input"), 1);
}

#[tokio::test]
async fn test_redelivered_duplicate_is_processed_independently() {
    let bus = mock_bus();
    for _ in 0..2 {
        bus.enqueue_input(
            json!({"request_text": "same"}),
            headers(&[("request_id", "dup"), ("chat_id", "c1")]),
        )
        .await
        .unwrap();
    }

    run_worker(&bus, Arc::new(EchoPipeline), options(2)).await;

    let outputs = bus.get_topic_messages("bridge-output").unwrap();
    assert_eq!(outputs.len(), 2);
    assert_eq!(outputs[0], outputs[1]);
}

#[tokio::test]
async fn test_worker_stops_on_cancellation() {
    let bus = mock_bus();
    let worker = Worker::new(bus.clone(), Arc::new(EchoPipeline), WorkerOptions::default());
    let shutdown = CancellationToken::new();

    let handle = {
        let worker = worker.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { worker.run(shutdown).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(worker.stats().state(), WorkerState::Consuming);

    shutdown.cancel();
    let snapshot = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("worker ignored cancellation")
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.state, WorkerState::Stopped);
    assert_eq!(snapshot.received, 0);
}

/// Takes far longer than any shutdown grace
struct Stalling;

#[async_trait]
impl Pipeline for Stalling {
    async fn respond(&self, request: &PipelineRequest) -> Result<PipelineResponse, PipelineError> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(PipelineResponse::text(request.text.clone()))
    }
}

#[tokio::test]
async fn test_shutdown_abandons_request_past_grace() {
    let bus = mock_bus();
    bus.enqueue_input(json!({"request_text": "slow"}), headers(&[("request_id", "r1")]))
        .await
        .unwrap();

    let options = WorkerOptions {
        shutdown_grace: Duration::from_millis(100),
        ..WorkerOptions::default()
    };
    let worker = Worker::new(bus.clone(), Arc::new(Stalling), options);
    let shutdown = CancellationToken::new();
    let handle = {
        let worker = worker.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { worker.run(shutdown).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown.cancel();
    let snapshot = tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("worker outlived its shutdown grace")
        .unwrap()
        .unwrap();

    assert!(bus.get_topic_messages("bridge-output").unwrap().is_empty());
    assert_eq!(bus.mock_backend().unwrap().acknowledged("bridge-input"), 0);
    assert_eq!(snapshot.received, 1);
    assert_eq!(snapshot.abandoned, 1);
    assert_eq!(snapshot.in_flight, 0);
    assert_eq!(snapshot.state, WorkerState::Stopped);
}

#[tokio::test]
async fn test_mock_instances_are_isolated() {
    let a = mock_bus();
    let b = mock_bus();
    a.enqueue_input(json!({"request_text": "x"}), Headers::new())
        .await
        .unwrap();

    assert_eq!(a.get_topic_messages("bridge-input").unwrap().len(), 1);
    assert!(b.get_topic_messages("bridge-input").unwrap().is_empty());

    a.mock_backend().unwrap().reset();
    assert!(a.get_topic_messages("bridge-input").unwrap().is_empty());
}
