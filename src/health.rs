/// Liveness, readiness and stats endpoints for a running worker

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::error::{BusError, Result};
use crate::worker::{StatsSnapshot, WorkerStats};

pub fn router(stats: Arc<WorkerStats>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/stats", get(stats_report))
        .layer(TraceLayer::new_for_http())
        .with_state(stats)
}

/// Serve the health router on `port` until `shutdown` fires
pub async fn serve(port: u16, stats: Arc<WorkerStats>, shutdown: CancellationToken) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| BusError::Config(format!("Cannot bind health endpoint on {}: {}", addr, e)))?;
    tracing::info!("Health endpoint listening on {}", addr);

    axum::serve(listener, router(stats))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| BusError::Transport(format!("Health endpoint failed: {}", e)))
}

/// Liveness
async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "bus-worker",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Ready while the worker holds a subscription
async fn readiness_check(
    State(stats): State<Arc<WorkerStats>>,
) -> std::result::Result<Json<serde_json::Value>, StatusCode> {
    let state = stats.state();
    if state.is_ready() {
        Ok(Json(serde_json::json!({
            "status": "ready",
            "service": "bus-worker",
            "state": state,
        })))
    } else {
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}

async fn stats_report(State(stats): State<Arc<WorkerStats>>) -> Json<StatsSnapshot> {
    Json(stats.snapshot())
}
