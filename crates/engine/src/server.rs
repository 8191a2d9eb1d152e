//! Status/control HTTP server.
//!
//! Exposes the engine over HTTP for operators and the scheduler process:
//! a read-only JSON snapshot of running sessions plus thin start/stop
//! routes that forward to the engine boundary.

use crate::engine::{BroadcastEngine, StartError, StartRequest, StopError};
use crate::params::EncodeOverrides;
use crate::registry::SessionInfo;
use crate::source::SourceSpec;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use thiserror::Error;
use tracing::info;

/// Errors that can occur when running the status server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

/// System-level metrics for resource monitoring
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub mem_usage_percent: f32,
    pub load_avg_1: f32,
    pub load_avg_5: f32,
    pub load_avg_15: f32,
}

impl Default for SystemMetrics {
    fn default() -> Self {
        Self {
            cpu_usage_percent: 0.0,
            mem_usage_percent: 0.0,
            load_avg_1: 0.0,
            load_avg_5: 0.0,
            load_avg_15: 0.0,
        }
    }
}

/// Collects current system metrics using sysinfo
pub fn collect_system_metrics() -> SystemMetrics {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let cpu_usage = sys.global_cpu_usage();
    let total_memory = sys.total_memory();
    let used_memory = sys.used_memory();
    let mem_usage = if total_memory > 0 {
        (used_memory as f64 / total_memory as f64 * 100.0) as f32
    } else {
        0.0
    };

    let load_avg = System::load_average();

    SystemMetrics {
        cpu_usage_percent: cpu_usage,
        mem_usage_percent: mem_usage,
        load_avg_1: load_avg.one as f32,
        load_avg_5: load_avg.five as f32,
        load_avg_15: load_avg.fifteen as f32,
    }
}

/// Complete engine snapshot served on the status endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub timestamp_unix_ms: i64,
    pub active_count: usize,
    pub sessions: Vec<SessionInfo>,
    pub system: SystemMetrics,
}

/// Get current timestamp in milliseconds
fn unix_timestamp_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Handler for GET /status
async fn get_status(State(engine): State<BroadcastEngine>) -> Json<EngineSnapshot> {
    let sessions = engine.sessions().await;
    Json(EngineSnapshot {
        timestamp_unix_ms: unix_timestamp_ms(),
        active_count: sessions.len(),
        sessions,
        system: collect_system_metrics(),
    })
}

/// Body of POST /broadcasts/{id}/start
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartBody {
    pub source: SourceSpec,
    pub destination_url: String,
    pub stream_key: String,
    #[serde(default)]
    pub duration_limit_secs: Option<u32>,
    #[serde(default)]
    pub overrides: EncodeOverrides,
}

/// Handler for POST /broadcasts/{id}/start
async fn start_broadcast(
    State(engine): State<BroadcastEngine>,
    Path(broadcast_id): Path<String>,
    Json(body): Json<StartBody>,
) -> (StatusCode, Json<serde_json::Value>) {
    let request = StartRequest {
        broadcast_id,
        source: body.source,
        destination_url: body.destination_url,
        stream_key: body.stream_key,
        duration_limit_secs: body.duration_limit_secs,
        overrides: body.overrides,
    };

    match engine.start(request).await {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({ "status": "accepted" }))),
        Err(e @ StartError::AlreadyActive(_)) => {
            (StatusCode::CONFLICT, Json(json!({ "error": e.to_string() })))
        }
        Err(e) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

/// Handler for POST /broadcasts/{id}/stop
async fn stop_broadcast(
    State(engine): State<BroadcastEngine>,
    Path(broadcast_id): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    match engine.stop(&broadcast_id).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "stopping" }))),
        Err(e @ StopError::NotActive(_)) => {
            (StatusCode::NOT_FOUND, Json(json!({ "error": e.to_string() })))
        }
    }
}

/// Creates the axum Router with status and control endpoints
pub fn create_router(engine: BroadcastEngine) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/broadcasts/:id/start", post(start_broadcast))
        .route("/broadcasts/:id/stop", post(stop_broadcast))
        .with_state(engine)
}

/// Runs the status server on 127.0.0.1 at the configured port
pub async fn run_server(engine: BroadcastEngine, port: u16) -> Result<(), ServerError> {
    let app = create_router(engine);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "status server listening");
    axum::serve(listener, app).await.map_err(ServerError::BindError)?;

    Ok(())
}
