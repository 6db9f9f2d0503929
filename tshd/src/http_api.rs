//! HTTP read API.
//!
//! Provides:
//! - `/status/health` - fleet summary (503 when UNHEALTHY)
//! - `/status/servers` - per-server summaries
//! - `/status/servers/{name}` - full most-recent result and circuit state
//! - `/status/metrics` - windowed metrics, JSON or Prometheus
//! - `/status/circuit-breaker[/{name}]` - circuit states
//! - `POST /status/circuit-breaker/{name}/reset` - force sub-states CLOSED
//!
//! Everything except the reset endpoint is read-only; all endpoints are
//! idempotent. Failures use one envelope: `{"error": {code, message,
//! request_id}}`.

use crate::breaker::ResetPath;
use crate::engine::Engine;
use crate::metrics::encode_prometheus;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::error;
use tsh_common::{HealthStatus, ServerName, TimeWindow};
use uuid::Uuid;

const CONTENT_TYPE_JSON: &str = "application/json; charset=utf-8";
const CONTENT_TYPE_PROMETHEUS: &str = "text/plain; version=0.0.4";

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<Engine>,
    pub version: &'static str,
    pub pid: u32,
}

/// Create the router for the read API.
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/status/health", get(health_handler))
        .route("/status/servers", get(servers_handler))
        .route("/status/servers/{name}", get(server_detail_handler))
        .route("/status/metrics", get(metrics_handler))
        .route("/status/circuit-breaker", get(circuit_all_handler))
        .route("/status/circuit-breaker/{name}", get(circuit_one_handler))
        .route(
            "/status/circuit-breaker/{name}/reset",
            post(circuit_reset_handler),
        )
        .with_state(Arc::new(state))
}

/// Start the HTTP server for the read API.
pub async fn start_server(
    listen: &str,
    state: ApiState,
) -> std::io::Result<tokio::task::JoinHandle<Result<(), std::io::Error>>> {
    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(listen).await?;
    tracing::info!("read API listening on {}", listener.local_addr()?);
    Ok(tokio::spawn(
        async move { axum::serve(listener, router).await },
    ))
}

// ── Error envelope ─────────────────────────────────────────────────────────

struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "NOT_FOUND",
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "BAD_REQUEST",
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "INTERNAL",
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let request_id = Uuid::new_v4().to_string();
        if self.status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(request_id, "read API internal error: {}", self.message);
        }
        let body = json!({
            "error": {
                "code": self.code,
                "message": self.message,
                "request_id": request_id,
            }
        });
        json_response(self.status, &body)
    }
}

/// Serialize a JSON response with the documented content type.
fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response {
    match serde_json::to_string(value) {
        Ok(body) => (
            status,
            [(header::CONTENT_TYPE, CONTENT_TYPE_JSON)],
            body,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, CONTENT_TYPE_JSON)],
            format!(
                "{{\"error\":{{\"code\":\"INTERNAL\",\"message\":\"serialization failed: {e}\",\"request_id\":\"{}\"}}}}",
                Uuid::new_v4()
            ),
        )
            .into_response(),
    }
}

// ── Handlers ───────────────────────────────────────────────────────────────

/// Handler for `/status/health` - fleet summary.
async fn health_handler(State(state): State<Arc<ApiState>>) -> Response {
    let engine = &state.engine;
    let epoch = engine.current_epoch();
    let results = engine.results();

    let mut healthy = 0u64;
    let mut degraded = 0u64;
    let mut unhealthy = 0u64;
    let mut unknown = 0u64;
    for server in &epoch.config.servers {
        match results.get(&server.server_name()).map(|r| r.overall_status) {
            Some(HealthStatus::Healthy) => healthy += 1,
            Some(HealthStatus::Degraded) => degraded += 1,
            Some(HealthStatus::Unhealthy) => unhealthy += 1,
            Some(HealthStatus::Unknown) | None => unknown += 1,
        }
    }

    // UNKNOWN servers (not yet checked) are neutral for the fleet verdict.
    let status = if unhealthy > 0 && healthy == 0 && degraded == 0 {
        HealthStatus::Unhealthy
    } else if unhealthy > 0 || degraded > 0 {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    };
    let http_status = if status == HealthStatus::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    let metrics = engine.metrics();
    let body = json!({
        "status": status,
        "observed_at": Utc::now().to_rfc3339(),
        "servers_total": epoch.config.servers.len(),
        "servers_by_status": {
            "HEALTHY": healthy,
            "DEGRADED": degraded,
            "UNHEALTHY": unhealthy,
            "UNKNOWN": unknown,
        },
        "protocol_success_rate_1h": metrics
            .path_success_rate(tsh_common::ProbePath::Protocol, TimeWindow::Last1h),
        "rest_success_rate_1h": metrics
            .path_success_rate(tsh_common::ProbePath::Rest, TimeWindow::Last1h),
        "uptime_seconds": engine.uptime_seconds(),
        "version": state.version,
        "pid": state.pid,
    });
    json_response(http_status, &body)
}

#[derive(Serialize)]
struct ServerSummary {
    server_name: String,
    overall_status: HealthStatus,
    health_score: f64,
    available_paths: Vec<tsh_common::ProbePath>,
    #[serde(skip_serializing_if = "Option::is_none")]
    observed_at: Option<String>,
    combined_duration_ms: u64,
}

/// Handler for `/status/servers` - per-server summaries.
async fn servers_handler(State(state): State<Arc<ApiState>>) -> Response {
    let engine = &state.engine;
    let epoch = engine.current_epoch();
    let results = engine.results();

    let summaries: Vec<ServerSummary> = epoch
        .config
        .servers
        .iter()
        .map(|server| match results.get(&server.server_name()) {
            Some(result) => ServerSummary {
                server_name: server.name.clone(),
                overall_status: result.overall_status,
                health_score: result.health_score,
                available_paths: result.available_paths.clone(),
                observed_at: Some(result.observed_at.to_rfc3339()),
                combined_duration_ms: result.combined_duration_ms,
            },
            None => ServerSummary {
                server_name: server.name.clone(),
                overall_status: HealthStatus::Unknown,
                health_score: 0.0,
                available_paths: Vec::new(),
                observed_at: None,
                combined_duration_ms: 0,
            },
        })
        .collect();

    json_response(StatusCode::OK, &summaries)
}

/// Handler for `/status/servers/{name}` - full most-recent result.
async fn server_detail_handler(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let engine = &state.engine;
    let server = ServerName::new(name.clone());
    let configured = engine
        .current_epoch()
        .config
        .servers
        .iter()
        .any(|s| s.name == name);
    if !configured {
        return Err(ApiError::not_found(format!("unknown server '{name}'")));
    }

    let circuit = engine
        .breaker()
        .snapshot(&server)
        .ok_or_else(|| ApiError::internal("circuit state missing for configured server"))?;
    let body = json!({
        "server_name": name,
        "result": engine.results().get(&server),
        "circuit": circuit,
    });
    Ok(json_response(StatusCode::OK, &body))
}

#[derive(Debug, Deserialize)]
struct MetricsQuery {
    window: Option<String>,
    server: Option<String>,
    format: Option<String>,
}

/// Handler for `/status/metrics` - windowed metrics, JSON or Prometheus.
async fn metrics_handler(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<MetricsQuery>,
) -> Result<Response, ApiError> {
    let engine = &state.engine;
    let window = match query.window.as_deref() {
        None => TimeWindow::Last1h,
        Some(raw) => TimeWindow::parse(raw).ok_or_else(|| {
            ApiError::bad_request(format!(
                "invalid window '{raw}': expected one of 1m, 5m, 1h, 24h"
            ))
        })?,
    };

    let epoch = engine.current_epoch();
    let servers: Vec<ServerName> = match &query.server {
        Some(name) => {
            let server = ServerName::new(name.clone());
            let known = epoch.config.servers.iter().any(|s| &s.name == name)
                || engine.metrics().known_servers().contains(&server);
            if !known {
                return Err(ApiError::not_found(format!("unknown server '{name}'")));
            }
            vec![server]
        }
        None => epoch
            .config
            .servers
            .iter()
            .map(|s| s.server_name())
            .collect(),
    };

    match query.format.as_deref().unwrap_or("json") {
        "json" => {
            let per_server: Vec<_> = servers
                .iter()
                .map(|s| engine.metrics().server_metrics(s, window))
                .collect();
            let body = json!({
                "window": window.label(),
                "servers": per_server,
                "counters": engine.metrics().counters(),
            });
            Ok(json_response(StatusCode::OK, &body))
        }
        "prometheus" => {
            let text = encode_prometheus(engine.metrics(), &servers, window)
                .map_err(|e| ApiError::internal(format!("metrics encoding failed: {e}")))?;
            Ok((
                StatusCode::OK,
                [(header::CONTENT_TYPE, CONTENT_TYPE_PROMETHEUS)],
                text,
            )
                .into_response())
        }
        other => Err(ApiError::bad_request(format!(
            "invalid format '{other}': expected json or prometheus"
        ))),
    }
}

/// Handler for `/status/circuit-breaker` - all circuit states.
async fn circuit_all_handler(State(state): State<Arc<ApiState>>) -> Response {
    json_response(StatusCode::OK, &state.engine.breaker().snapshot_all())
}

/// Handler for `/status/circuit-breaker/{name}`.
async fn circuit_one_handler(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let snapshot = state
        .engine
        .breaker()
        .snapshot(&ServerName::new(name.clone()))
        .ok_or_else(|| ApiError::not_found(format!("unknown server '{name}'")))?;
    Ok(json_response(StatusCode::OK, &snapshot))
}

#[derive(Debug, Default, Deserialize)]
struct ResetBody {
    #[serde(default)]
    path: Option<ResetPath>,
}

/// Handler for `POST /status/circuit-breaker/{name}/reset`.
async fn circuit_reset_handler(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
    body: Option<Json<ResetBody>>,
) -> Result<Response, ApiError> {
    let which = body
        .and_then(|Json(b)| b.path)
        .unwrap_or(ResetPath::Both);
    let snapshot = state
        .engine
        .breaker()
        .reset(&ServerName::new(name.clone()), which)
        .ok_or_else(|| ApiError::not_found(format!("unknown server '{name}'")))?;
    Ok(json_response(StatusCode::OK, &snapshot))
}
