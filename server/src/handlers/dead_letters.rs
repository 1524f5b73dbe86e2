//! Operator workflow for buried messages.
//!
//! Only served when a dead-letter database is configured; otherwise every
//! endpoint answers 404 `DEAD_LETTERS_DISABLED`.

use crate::error::AppError;
use crate::state::AppState;
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use prscan_core::{DeadLetter, DeadLetterStatus, EntryId, StreamName};
use prscan_runtime::DeadLetterReplayer;
use serde::{Deserialize, Serialize};

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 1000;

/// `GET /dead-letters` query.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    /// `pending` (default), `replayed`, `discarded` or `all`
    pub status: Option<String>,
    /// At most this many letters (default 100, capped at 1000)
    pub limit: Option<usize>,
}

/// Who resolves a letter, and why.
#[derive(Debug, Default, Deserialize)]
pub struct ResolveBody {
    /// Operator name
    pub operator: Option<String>,
    /// Free-form notes
    pub notes: Option<String>,
}

/// Replay response.
#[derive(Debug, Serialize)]
pub struct ReplayResponse {
    /// The resolved letter
    pub letter: DeadLetter,
    /// Entry the message was appended as
    pub new_entry_id: String,
}

/// List dead letters, oldest first.
///
/// ```text
/// GET /dead-letters?status=pending&limit=100
/// ```
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<DeadLetter>>, AppError> {
    let sink = state.dead_letters.as_ref().ok_or_else(disabled)?;
    let status = match query.status.as_deref() {
        None => Some(DeadLetterStatus::Pending),
        Some("all") => None,
        Some(raw) => Some(
            DeadLetterStatus::parse(raw).map_err(|e| AppError::validation(e.to_string()))?,
        ),
    };
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    Ok(Json(sink.list(status, limit).await?))
}

/// Append a buried message to its stream again.
///
/// ```text
/// POST /dead-letters/{stream}/{entry_id}/replay
/// ```
///
/// # Status Codes
///
/// - 200 OK: replayed
/// - 404: no such letter
/// - 409: already replayed or discarded
/// - 503: dead-letter store or stream log unavailable
pub async fn replay(
    State(state): State<AppState>,
    Path((stream, entry_id)): Path<(String, String)>,
    body: Option<Json<ResolveBody>>,
) -> Result<Json<ReplayResponse>, AppError> {
    let replayer = replayer(&state)?;
    let (stream, entry_id) = parse_key(stream, &entry_id)?;
    let body = body.map(|Json(b)| b).unwrap_or_default();

    let (letter, new_entry_id) = replayer
        .replay(&stream, entry_id, operator(body.operator), body.notes)
        .await?;
    Ok(Json(ReplayResponse {
        letter,
        new_entry_id: new_entry_id.to_string(),
    }))
}

/// Give up on a buried message for good.
///
/// ```text
/// POST /dead-letters/{stream}/{entry_id}/discard
/// ```
pub async fn discard(
    State(state): State<AppState>,
    Path((stream, entry_id)): Path<(String, String)>,
    body: Option<Json<ResolveBody>>,
) -> Result<(StatusCode, Json<DeadLetter>), AppError> {
    let replayer = replayer(&state)?;
    let (stream, entry_id) = parse_key(stream, &entry_id)?;
    let body = body.map(|Json(b)| b).unwrap_or_default();

    let letter = replayer
        .discard(&stream, entry_id, operator(body.operator), body.notes)
        .await?;
    Ok((StatusCode::OK, Json(letter)))
}

fn disabled() -> AppError {
    AppError::new(
        StatusCode::NOT_FOUND,
        "Dead letters are not configured".to_string(),
        "DEAD_LETTERS_DISABLED".to_string(),
    )
}

fn replayer(state: &AppState) -> Result<DeadLetterReplayer, AppError> {
    state.replayer().ok_or_else(disabled)
}

fn parse_key(stream: String, entry_id: &str) -> Result<(StreamName, EntryId), AppError> {
    let entry_id = entry_id
        .parse::<EntryId>()
        .map_err(|e| AppError::validation(e.to_string()))?;
    Ok((StreamName::new(stream), entry_id))
}

fn operator(name: Option<String>) -> String {
    name.filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| "operator".to_string())
}
