//! bus-worker CLI - consume requests from the input topic and publish responses
//!
//! Reads configuration from the environment (and `.env`), or from a YAML file.

use clap::{Parser, Subcommand};
use std::error::Error;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use bus_bridge::bus::keys;
use bus_bridge::{
    health, new_request_id, BusConfig, EchoPipeline, Headers, InputPayload, MessageBus, Worker,
    WorkerOptions,
};

#[derive(Parser)]
#[command(name = "bus-worker")]
#[command(version, about = "Request/response worker over Kafka or an in-memory bus", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume the input topic until interrupted
    Run {
        /// YAML bus configuration (defaults to environment variables)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Stop after this many requests were settled
        #[arg(long)]
        max_messages: Option<u64>,

        /// Requests processed concurrently (overrides WORKER_CONCURRENCY)
        #[arg(long)]
        concurrency: Option<usize>,

        /// Serve /health, /ready and /stats on this port (overrides HEALTH_PORT)
        #[arg(long)]
        health_port: Option<u16>,
    },

    /// Publish one request on the input topic
    Enqueue {
        /// Request text
        text: String,

        /// YAML bus configuration (defaults to environment variables)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Correlation id (generated when omitted)
        #[arg(long)]
        request_id: Option<String>,

        #[arg(long)]
        bot_id: Option<String>,

        #[arg(long)]
        chat_id: Option<String>,

        /// Opaque natal chart, usually JSON
        #[arg(long)]
        natal_chart: Option<String>,
    },

    /// Round-trip one request through an in-memory bus and print the output
    MockRun {
        /// Request text
        #[arg(default_value = "hello")]
        text: String,

        #[arg(long, default_value = "mock-bot")]
        bot_id: String,

        #[arg(long, default_value = "mock-chat")]
        chat_id: String,

        #[arg(long)]
        natal_chart: Option<String>,

        /// Correlation id (generated when omitted)
        #[arg(long)]
        request_id: Option<String>,

        /// Send the request without a request_id to see it dropped
        #[arg(long, conflicts_with = "request_id")]
        no_request_id: bool,
    },
}

#[tokio::main]
async fn main() {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            config,
            max_messages,
            concurrency,
            health_port,
        } => run_worker(config, max_messages, concurrency, health_port).await,
        Commands::Enqueue {
            text,
            config,
            request_id,
            bot_id,
            chat_id,
            natal_chart,
        } => {
            let request_id = request_id.unwrap_or_else(new_request_id);
            let headers = request_headers(Some(request_id), bot_id, chat_id, natal_chart);
            enqueue(config, text, headers).await
        }
        Commands::MockRun {
            text,
            bot_id,
            chat_id,
            natal_chart,
            request_id,
            no_request_id,
        } => {
            let request_id = (!no_request_id).then(|| request_id.unwrap_or_else(new_request_id));
            let headers = request_headers(request_id, Some(bot_id), Some(chat_id), natal_chart);
            mock_run(text, headers).await
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn load_config(path: Option<PathBuf>) -> Result<BusConfig, Box<dyn Error>> {
    Ok(match path {
        Some(path) => BusConfig::load_from_file(path)?,
        None => BusConfig::from_env()?,
    })
}

/// Correlation headers for a request; absent values are left out
fn request_headers(
    request_id: Option<String>,
    bot_id: Option<String>,
    chat_id: Option<String>,
    natal_chart: Option<String>,
) -> Headers {
    let mut headers = Headers::new();
    for (key, value) in [
        (keys::REQUEST_ID, request_id),
        (keys::BOT_ID, bot_id),
        (keys::CHAT_ID, chat_id),
        (keys::NATAL_CHART, natal_chart),
    ] {
        if let Some(value) = value {
            headers.insert(key.to_string(), value);
        }
    }
    headers
}

/// Run the worker against the configured bus
async fn run_worker(
    config: Option<PathBuf>,
    max_messages: Option<u64>,
    concurrency: Option<usize>,
    health_port: Option<u16>,
) -> Result<(), Box<dyn Error>> {
    let bus = MessageBus::new(load_config(config)?)?;

    let mut options = WorkerOptions::from_env()?;
    options.max_messages = max_messages;
    if let Some(concurrency) = concurrency {
        options.concurrency = concurrency;
    }

    let health_port = match health_port {
        Some(port) => Some(port),
        None => std::env::var("HEALTH_PORT")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(|v| v.trim().parse::<u16>())
            .transpose()
            .map_err(|e| format!("HEALTH_PORT is not a valid port: {}", e))?,
    };

    let worker = Worker::new(bus.clone(), Arc::new(EchoPipeline), options);
    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    let health = health_port.map(|port| {
        let stats = worker.stats();
        let token = shutdown.child_token();
        tokio::spawn(async move {
            if let Err(e) = health::serve(port, stats, token).await {
                tracing::error!("{}", e);
            }
        })
    });

    let result = worker.run(shutdown.clone()).await;

    shutdown.cancel();
    if let Some(handle) = health {
        handle.await.ok();
    }
    bus.close().await;

    let snapshot = result?;
    tracing::info!("Final stats: {}", serde_json::to_string(&snapshot)?);
    Ok(())
}

async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("Cannot listen for SIGTERM: {}", e);
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await.ok();

    tracing::info!("Received shutdown signal, stopping worker");
    shutdown.cancel();
}

/// Publish a single request
async fn enqueue(config: Option<PathBuf>, text: String, headers: Headers) -> Result<(), Box<dyn Error>> {
    let bus = MessageBus::new(load_config(config)?)?;
    let request_id = headers
        .get(keys::REQUEST_ID)
        .cloned()
        .unwrap_or_default();

    bus.enqueue_input(InputPayload::new(text).to_value(), headers)
        .await?;
    bus.close().await;

    println!("Enqueued request {} on {}", request_id, bus.config().input_topic);
    Ok(())
}

/// Enqueue one request on a fresh in-memory bus, process it and print the result
async fn mock_run(text: String, headers: Headers) -> Result<(), Box<dyn Error>> {
    let bus = MessageBus::mock(BusConfig::mock())?;
    bus.enqueue_input(InputPayload::new(text).to_value(), headers)
        .await?;

    let options = WorkerOptions {
        max_messages: Some(1),
        ..WorkerOptions::default()
    };
    Worker::new(bus.clone(), Arc::new(EchoPipeline), options)
        .run(CancellationToken::new())
        .await?;

    let outputs = bus.get_topic_messages(&bus.config().output_topic)?;
    match outputs.last() {
        Some(output) => println!("{}", serde_json::to_string_pretty(output)?),
        None => println!("No output messages produced."),
    }
    Ok(())
}
