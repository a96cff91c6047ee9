//! Health check handlers for queue workers.
//!
//! This module provides reusable Axum handlers for:
//! - Liveness probes (`/health`, `/healthz`)
//! - Readiness probes (`/ready`, `/readyz`)
//! - Queue monitoring (`/queue/info`, `/queue/staged`)
//! - Prometheus metrics (`/metrics`)
//! - Manual recovery (`POST /admin/sweep`)

use axum::{
    Json,
    extract::{Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::envelope::Envelope;
use crate::metrics;
use crate::queue::ReliableQueue;

/// Shared state for health endpoints.
#[derive(Clone)]
pub struct HealthState {
    /// Queue being monitored.
    pub queue: ReliableQueue,
    /// Application name.
    pub app_name: String,
    /// Application version.
    pub app_version: String,
}

impl HealthState {
    pub fn new(
        queue: ReliableQueue,
        app_name: impl Into<String>,
        app_version: impl Into<String>,
    ) -> Self {
        Self {
            queue,
            app_name: app_name.into(),
            app_version: app_version.into(),
        }
    }
}

/// Health response for liveness probes.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Status (always "healthy" if responding).
    pub status: &'static str,
    /// Application name.
    pub name: String,
    /// Application version.
    pub version: String,
}

/// Liveness probe handler.
///
/// Always returns OK if the server is running.
pub async fn health_handler(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        name: state.app_name,
        version: state.app_version,
    })
}

/// Readiness probe handler.
///
/// Checks that the store answers.
pub async fn ready_handler(
    State(state): State<HealthState>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    match state.queue.store().ping().await {
        Ok(()) => Ok((
            StatusCode::OK,
            Json(json!({
                "status": "ready",
                "checks": {
                    "store": "ok"
                }
            })),
        )),
        Err(e) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "checks": {
                    "store": format!("error: {}", e)
                }
            })),
        )),
    }
}

/// Queue depths.
///
/// `GET /queue/info`
pub async fn queue_info_handler(
    State(state): State<HealthState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.queue.stats().await {
        Ok(stats) => Ok(Json(json!({
            "queue": state.queue.name(),
            "ack_key": state.queue.ack_key(),
            "queue_len": stats.queue_len,
            "staged_len": stats.staged_len,
        }))),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "error": format!("Failed to get queue info: {}", e)
            })),
        )),
    }
}

/// Query parameters for the staged entries endpoint.
#[derive(Debug, Deserialize)]
pub struct StagedListParams {
    /// Maximum entries to return (default: 10, max: 100)
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Offset into the staging list (default: 0)
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    10
}

/// One staged entry as shown to operators. Invalid UTF-8 in `raw` is
/// replaced with U+FFFD.
#[derive(Debug, Serialize)]
pub struct StagedEntry {
    pub raw: String,
    pub expiry: Option<i64>,
    pub malformed: bool,
}

/// Page through the staging list.
///
/// `GET /queue/staged?limit=10&offset=0`
pub async fn staged_list_handler(
    State(state): State<HealthState>,
    Query(params): Query<StagedListParams>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let limit = params.limit.clamp(1, 100);
    let bounds = params.offset.checked_add(limit - 1).and_then(|last| {
        Some((isize::try_from(params.offset).ok()?, isize::try_from(last).ok()?))
    });
    let Some((start, stop)) = bounds else {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("offset {} is out of range", params.offset) })),
        ));
    };

    match state
        .queue
        .store()
        .range(state.queue.ack_key(), start, stop)
        .await
    {
        Ok(raw_entries) => {
            let entries: Vec<StagedEntry> = raw_entries
                .into_iter()
                .map(|raw| {
                    let expiry = Envelope::decode(&raw).ok().map(|e| e.expiry);
                    StagedEntry {
                        malformed: expiry.is_none(),
                        expiry,
                        raw: String::from_utf8_lossy(&raw).into_owned(),
                    }
                })
                .collect();

            Ok(Json(json!({
                "count": entries.len(),
                "limit": limit,
                "offset": params.offset,
                "entries": entries,
            })))
        }
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )),
    }
}

/// Run one sweeper pass now.
///
/// `POST /admin/sweep`
pub async fn sweep_handler(
    State(state): State<HealthState>,
) -> Result<impl IntoResponse, (StatusCode, Json<Value>)> {
    match state.queue.sweeper().sweep().await {
        Ok(report) => Ok(Json(report)),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )),
    }
}

/// Prometheus metrics endpoint handler.
///
/// Returns metrics in Prometheus text format for scraping.
pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::prometheus_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized. Call metrics::init_metrics() at startup.".to_string(),
        )
            .into_response(),
    }
}

/// Create a router with health, monitoring and admin endpoints.
pub fn health_router(state: HealthState) -> axum::Router {
    use axum::routing::{get, post};

    axum::Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/queue/info", get(queue_info_handler))
        .route("/queue/staged", get(staged_list_handler))
        .route("/metrics", get(metrics_handler))
        .route("/admin/sweep", post(sweep_handler))
        .with_state(state)
}
