//! Redis backend for prscan.
//!
//! One [`ConnectionManager`] is shared by the three stores:
//!
//! - [`RedisRequestStore`]: `storage:{id}` records with native expiry
//! - [`RedisStreamLog`]: one Redis stream per worker pool, consumer groups for
//!   delivery tracking
//! - [`RedisCompletionLedger`]: `completions:{id}` hashes
//!
//! Blocking `XREADGROUP` calls get a second connection of their own. Redis
//! answers one connection's commands in order, so a read blocked on an idle
//! stream would otherwise hold up every store call (and `/status` pings)
//! behind it.
//!
//! The key layout matches the deployed workers (stream entries carry a single
//! `data` field; request records live at `storage:{id}`), so old and new
//! components can share one Redis during a migration.
//!
//! # Example
//!
//! ```no_run
//! use prscan_redis::RedisBackend;
//! use prscan_core::{StreamLog, StreamMessage, StreamName, RequestId};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = RedisBackend::connect("redis://127.0.0.1:6379").await?;
//! let log = backend.stream_log();
//! let id = log
//!     .append(&StreamName::new("worker-kics"), StreamMessage::new(RequestId::generate(), ""))
//!     .await?;
//! println!("appended {id}");
//! # Ok(())
//! # }
//! ```

use prscan_core::{RequestId, StreamLogError, StreamName};
use redis::Client;
use redis::aio::ConnectionManager;
use thiserror::Error;

mod completion_ledger;
mod request_store;
mod stream_log;

pub use completion_ledger::RedisCompletionLedger;
pub use request_store::RedisRequestStore;
pub use stream_log::RedisStreamLog;

/// Errors connecting to Redis.
#[derive(Error, Debug)]
pub enum RedisBackendError {
    /// Invalid URL
    #[error("Failed to create Redis client: {0}")]
    Client(String),

    /// Initial connection failed
    #[error("Failed to create Redis connection manager: {0}")]
    Connection(String),
}

/// Key prefixes owned by the request store and completion ledger.
const RESERVED_PREFIXES: [&str; 2] = ["storage:", "completions:"];

/// Key naming, with an optional prefix for sharing a Redis between
/// environments.
#[derive(Debug, Clone, Default)]
pub(crate) struct KeyLayout {
    prefix: String,
}

impl KeyLayout {
    /// Stream names share the keyspace with request records, so names that
    /// would land on a record or index key are refused.
    pub(crate) fn stream(&self, stream: &StreamName) -> Result<String, StreamLogError> {
        if RESERVED_PREFIXES
            .iter()
            .any(|reserved| stream.as_str().starts_with(reserved))
        {
            return Err(StreamLogError::ReservedName(stream.clone()));
        }
        Ok(format!("{}{stream}", self.prefix))
    }

    pub(crate) fn request(&self, id: RequestId) -> String {
        self.request_raw(&id.to_string())
    }

    pub(crate) fn request_raw(&self, id: &str) -> String {
        format!("{}storage:{id}", self.prefix)
    }

    pub(crate) fn expiry_index(&self) -> String {
        format!("{}storage:expiry", self.prefix)
    }

    pub(crate) fn completions(&self, id: RequestId) -> String {
        format!("{}completions:{id}", self.prefix)
    }
}

/// Connections shared by the Redis stores.
#[derive(Clone)]
pub struct RedisBackend {
    conn_manager: ConnectionManager,
    blocking_manager: ConnectionManager,
    keys: KeyLayout,
}

impl RedisBackend {
    /// Connect to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    ///
    /// # Errors
    ///
    /// Returns error if the URL is invalid or the connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, RedisBackendError> {
        let client =
            Client::open(redis_url).map_err(|e| RedisBackendError::Client(e.to_string()))?;
        let conn_manager = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| RedisBackendError::Connection(e.to_string()))?;
        let blocking_manager = ConnectionManager::new(client)
            .await
            .map_err(|e| RedisBackendError::Connection(e.to_string()))?;
        tracing::info!("Connected to Redis");
        Ok(Self {
            conn_manager,
            blocking_manager,
            keys: KeyLayout::default(),
        })
    }

    /// Prefix every key with `prefix` (e.g. `"staging:"`).
    #[must_use]
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.keys.prefix = prefix.into();
        self
    }

    /// Request store on this connection.
    #[must_use]
    pub fn request_store(&self) -> RedisRequestStore {
        RedisRequestStore::new(self.conn_manager.clone(), self.keys.clone())
    }

    /// Stream log on this connection; group reads use the blocking one.
    #[must_use]
    pub fn stream_log(&self) -> RedisStreamLog {
        RedisStreamLog::new(
            self.conn_manager.clone(),
            self.blocking_manager.clone(),
            self.keys.clone(),
        )
    }

    /// Completion ledger on this connection.
    #[must_use]
    pub fn completion_ledger(&self) -> RedisCompletionLedger {
        RedisCompletionLedger::new(self.conn_manager.clone(), self.keys.clone())
    }
}
