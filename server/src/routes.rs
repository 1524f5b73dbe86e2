//! Router construction.

use crate::handlers::{callbacks, dead_letters, dispatch, status};
use crate::state::{AppState, OpsState};
use axum::Router;
use axum::extract::FromRef;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

/// Coordinator routes.
///
/// ```text
/// POST /dispatch                                  store and fan out a trigger
/// POST /callbacks                                 correlate a completion
/// GET  /requests/:request_id                      completions so far
/// POST /requests/:request_id/refanout             append to streams again
/// GET  /dead-letters                              list buried messages
/// POST /dead-letters/:stream/:entry_id/replay     re-append a buried message
/// POST /dead-letters/:stream/:entry_id/discard    give up on it
/// GET  /status                                    backend health
/// GET  /metrics                                   Prometheus scrape
/// ```
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/dispatch", post(dispatch::dispatch))
        .route("/callbacks", post(callbacks::callback))
        .route("/requests/:request_id", get(dispatch::request_status))
        .route("/requests/:request_id/refanout", post(dispatch::refanout))
        .route("/dead-letters", get(dead_letters::list))
        .route(
            "/dead-letters/:stream/:entry_id/replay",
            post(dead_letters::replay),
        )
        .route(
            "/dead-letters/:stream/:entry_id/discard",
            post(dead_letters::discard),
        )
        .merge(ops_router::<AppState>())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `/status` and `/metrics` only.
///
/// Merged into the coordinator router; served alone by workers.
pub fn ops_router<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
    OpsState: FromRef<S>,
{
    Router::new()
        .route("/status", get(status::status))
        .route("/metrics", get(status::metrics))
}
