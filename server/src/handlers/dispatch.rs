//! Trigger intake.

use crate::error::AppError;
use crate::state::AppState;
use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use prscan_core::{CompletionRecord, RequestId, RequestPayload, RequestStoreError, StreamName};
use prscan_runtime::DispatchReceipt;
use serde::{Deserialize, Serialize};

/// Inbound trigger: the request payload plus where to fan it out.
#[derive(Debug, Deserialize)]
pub struct DispatchBody {
    /// Target worker streams; the configured defaults when empty
    #[serde(default, alias = "streams")]
    pub target_streams: Vec<StreamName>,
    /// Everything else is the request payload
    #[serde(flatten)]
    pub payload: RequestPayload,
}

/// Store a request and fan it out.
///
/// # Endpoint
///
/// ```text
/// POST /dispatch
/// ```
///
/// # Status Codes
///
/// - 202 Accepted: stored and appended to every stream
/// - 422: malformed body, missing fields or no target streams
/// - 502: stored, but some appends failed (body lists `succeeded`/`failed`)
/// - 503: the request store is unavailable; nothing was appended
pub async fn dispatch(
    State(state): State<AppState>,
    body: Result<Json<DispatchBody>, JsonRejection>,
) -> Result<(StatusCode, Json<DispatchReceipt>), AppError> {
    let Json(body) = body?;
    if body.payload.owner.trim().is_empty() || body.payload.repo.trim().is_empty() {
        return Err(AppError::validation("owner and repo are required"));
    }
    let streams = if body.target_streams.is_empty() {
        state.default_streams.clone()
    } else {
        body.target_streams
    };

    let receipt = state.dispatcher.dispatch(body.payload, &streams).await?;
    tracing::info!(
        request_id = %receipt.request_id,
        streams = receipt.streams.len(),
        "Request dispatched"
    );
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

/// Body of a re-fan-out.
#[derive(Debug, Deserialize)]
pub struct RefanoutBody {
    /// Streams to append to again
    pub streams: Vec<StreamName>,
}

/// Append an existing request to streams again, typically the ones a
/// partial fan-out reported as failed.
///
/// # Endpoint
///
/// ```text
/// POST /requests/{request_id}/refanout
/// ```
pub async fn refanout(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
    body: Result<Json<RefanoutBody>, JsonRejection>,
) -> Result<(StatusCode, Json<DispatchReceipt>), AppError> {
    let request_id = parse_request_id(&request_id)?;
    let Json(body) = body?;
    let receipt = state.dispatcher.refanout(request_id, &body.streams).await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

/// Completions recorded for a request.
#[derive(Debug, Serialize)]
pub struct CompletionsResponse {
    /// Request
    pub request_id: RequestId,
    /// Streams the request was fanned out to
    pub expected: u32,
    /// Recorded completions
    pub completions: Vec<CompletionRecord>,
}

/// Completion progress of a stored request.
///
/// # Endpoint
///
/// ```text
/// GET /requests/{request_id}
/// ```
pub async fn request_status(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
) -> Result<Json<CompletionsResponse>, AppError> {
    let request_id = parse_request_id(&request_id)?;
    let request = match state.store.get(request_id).await {
        Ok(request) => request,
        Err(RequestStoreError::NotFound(_)) => {
            return Err(AppError::not_found("Request", request_id));
        }
        Err(e) => {
            return Err(AppError::unavailable("Request store unavailable")
                .with_source(anyhow::Error::new(e)));
        }
    };
    let completions = state.correlator.completions(request_id).await?;
    Ok(Json(CompletionsResponse {
        request_id,
        expected: request.expected_completions,
        completions,
    }))
}

fn parse_request_id(raw: &str) -> Result<RequestId, AppError> {
    raw.parse::<RequestId>()
        .map_err(|e| AppError::validation(e.to_string()))
}
