//! # prscan server
//!
//! HTTP surface and process wiring for the fan-out coordinator.
//!
//! Two binaries are built from this crate:
//!
//! - `coordinator`: accepts triggers on `POST /dispatch`, correlates worker
//!   callbacks on `POST /callbacks`, sweeps expired requests and exposes the
//!   dead-letter workflow
//! - `worker`: consumes one stream as one member of a consumer group, runs
//!   the configured scan command per message and reports back
//!
//! # Request Flow
//!
//! ```text
//! trigger ─▶ POST /dispatch ─▶ request store + one entry per stream
//!                                      │
//!             worker-kics ◀────────────┤──────────▶ worker-blackduck
//!                  │                                      │
//!                  └──────▶ POST /callbacks ◀─────────────┘
//! ```
//!
//! Both processes read their settings from the environment (see [`Config`]).

pub mod config;
pub mod error;
pub mod handlers;
pub mod lifecycle;
pub mod routes;
pub mod scanner;
pub mod state;

pub use config::{Config, ConfigError};
pub use error::AppError;
pub use lifecycle::{Shutdown, init_tracing, shutdown_signal, stopped};
pub use routes::{build_router, ops_router};
pub use scanner::CommandScanner;
pub use state::{AppState, OpsState};

/// Result type alias for HTTP handlers.
pub type WebResult<T> = Result<T, AppError>;
