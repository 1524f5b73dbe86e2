//! Completion callbacks from workers.

use crate::error::AppError;
use crate::state::AppState;
use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use prscan_core::{CompletionNotice, CompletionOutcome, CorrelatedCompletion};
use serde::Serialize;

/// Callback response.
#[derive(Debug, Serialize)]
pub struct CallbackResponse {
    /// `accepted`, `duplicate` or `unknown_request`
    pub outcome: &'static str,
    /// The merged completion, for accepted notices
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion: Option<Box<CorrelatedCompletion>>,
}

/// Correlate a completion notice.
///
/// All three outcomes answer 200: a duplicate or a notice for an expired
/// request is not something the worker can fix by retrying.
///
/// # Endpoint
///
/// ```text
/// POST /callbacks
/// ```
///
/// # Status Codes
///
/// - 200 OK: `{"outcome": ...}`
/// - 422: malformed notice
/// - 503: request store or completion ledger unavailable (retry)
pub async fn callback(
    State(state): State<AppState>,
    notice: Result<Json<CompletionNotice>, JsonRejection>,
) -> Result<Json<CallbackResponse>, AppError> {
    let Json(notice) = notice?;
    let outcome = state.correlator.complete_notice(notice).await?;
    let label = outcome.as_str();
    let completion = match outcome {
        CompletionOutcome::Accepted(merged) => Some(merged),
        CompletionOutcome::Duplicate | CompletionOutcome::UnknownRequest => None,
    };
    Ok(Json(CallbackResponse {
        outcome: label,
        completion,
    }))
}
