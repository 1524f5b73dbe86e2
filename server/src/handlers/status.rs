//! Health and metrics endpoints.
//!
//! These endpoints are used by load balancers and monitoring systems
//! to verify service health.

use crate::state::OpsState;
use axum::Json;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use prscan_runtime::{HealthReport, HealthStatus};
use serde::Serialize;

/// Status response.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    /// Overall status: `healthy`, `degraded` or `unhealthy`
    pub status: HealthStatus,
    /// `ok` when the stream log answers, `error` otherwise
    pub redis: &'static str,
    /// Worker loop phase, on worker processes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_phase: Option<&'static str>,
    /// Per-component checks
    pub health: HealthReport,
}

/// Backend liveness.
///
/// # Status Codes
///
/// - 200 OK: Healthy or Degraded
/// - 503 Service Unavailable: Unhealthy
///
/// # Endpoint
///
/// ```text
/// GET /status
/// ```
///
/// # Response
///
/// ```json
/// {
///   "status": "healthy",
///   "redis": "ok",
///   "health": { "status": "healthy", "checks": [...], "timestamp": "..." }
/// }
/// ```
pub async fn status(State(state): State<OpsState>) -> (StatusCode, Json<StatusResponse>) {
    let health =
        prscan_runtime::probe(&state.store, &state.log, state.dead_letters.as_ref()).await;
    let redis = match health.check("stream_log") {
        Some(check) if !check.status.is_unhealthy() => "ok",
        _ => "error",
    };
    let code = if health.is_unhealthy() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    let worker_phase = state.worker_phase.as_ref().map(|rx| rx.borrow().as_str());
    (
        code,
        Json(StatusResponse {
            status: health.status,
            redis,
            worker_phase,
            health,
        }),
    )
}

/// Prometheus scrape endpoint.
///
/// ```text
/// GET /metrics
/// ```
#[allow(clippy::unused_async)]
pub async fn metrics(State(state): State<OpsState>) -> Response {
    match state.metrics.as_ref().and_then(|m| m.render()) {
        Some(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}
