//! Request store trait.
//!
//! The request store is the only durable home of a [`WorkRequest`]. The
//! dispatcher writes it, workers and the callback correlator read it, and the
//! retention sweep retires it.
//!
//! # Implementations
//!
//! - `InMemoryRequestStore` (`prscan-testing`): `HashMap` behind a lock
//! - `RedisRequestStore` (`prscan-redis`): `storage:{id}` keys with `EXAT`
//!   expiry plus an expiry index for the sweep

use crate::request::{RequestId, WorkRequest};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during request store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestStoreError {
    /// A request with this id is already stored; the caller must use a fresh id
    #[error("Request already exists: {0}")]
    AlreadyExists(RequestId),

    /// No live request with this id (never stored, deleted, or expired)
    #[error("Request not found: {0}")]
    NotFound(RequestId),

    /// Backing storage unreachable or failed
    #[error("Request store unavailable: {0}")]
    Unavailable(String),

    /// Stored record could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl RequestStoreError {
    /// Whether retrying the same call later could succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Key-addressable, expiring store of work requests.
///
/// # Thread Safety
///
/// Implementations are shared by dispatchers, workers and correlators across
/// tasks and processes; they must be `Send + Sync` and need no caller-side
/// locking.
///
/// # Dyn Compatibility
///
/// Methods return `Pin<Box<dyn Future>>` rather than `async fn` so the store
/// can be held as `Arc<dyn RequestStore>`.
pub trait RequestStore: Send + Sync {
    /// Store a new request keyed by its id.
    ///
    /// # Errors
    ///
    /// - [`RequestStoreError::AlreadyExists`] if the id is taken
    /// - [`RequestStoreError::Unavailable`] if the backend fails
    fn put(
        &self,
        request: WorkRequest,
    ) -> Pin<Box<dyn Future<Output = Result<(), RequestStoreError>> + Send + '_>>;

    /// Fetch a request. Requests past their expiry read as not found.
    ///
    /// # Errors
    ///
    /// - [`RequestStoreError::NotFound`] if absent or expired
    /// - [`RequestStoreError::Unavailable`] if the backend fails
    fn get(
        &self,
        id: RequestId,
    ) -> Pin<Box<dyn Future<Output = Result<WorkRequest, RequestStoreError>> + Send + '_>>;

    /// Remove a request. Removing an absent request is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`RequestStoreError::Unavailable`] if the backend fails.
    fn delete(
        &self,
        id: RequestId,
    ) -> Pin<Box<dyn Future<Output = Result<(), RequestStoreError>> + Send + '_>>;

    /// Remove every request with `expires_at <= now` and return how many were
    /// removed.
    ///
    /// # Errors
    ///
    /// Returns [`RequestStoreError::Unavailable`] if the backend fails.
    fn sweep(
        &self,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<usize, RequestStoreError>> + Send + '_>>;

    /// Liveness probe for health reporting.
    ///
    /// # Errors
    ///
    /// Returns [`RequestStoreError::Unavailable`] if the backend is unreachable.
    fn ping(&self) -> Pin<Box<dyn Future<Output = Result<(), RequestStoreError>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }
}
