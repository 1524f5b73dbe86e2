//! Redis [`CompletionLedger`].
//!
//! One hash per request, `completions:{request_id}`, field = worker identity,
//! value = JSON [`CompletionRecord`]. `HSETNX` gives the insert-if-absent
//! step; it runs in one `MULTI` with the `EXPIREAT` that makes the hash expire
//! with the request.

use crate::KeyLayout;
use chrono::{DateTime, Utc};
use prscan_core::{CompletionError, CompletionLedger, CompletionRecord, RequestId, WorkerIdentity};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

/// [`CompletionLedger`] backed by Redis hashes.
#[derive(Clone)]
pub struct RedisCompletionLedger {
    conn_manager: ConnectionManager,
    keys: KeyLayout,
}

impl RedisCompletionLedger {
    pub(crate) const fn new(conn_manager: ConnectionManager, keys: KeyLayout) -> Self {
        Self { conn_manager, keys }
    }
}

impl CompletionLedger for RedisCompletionLedger {
    fn record(
        &self,
        record: CompletionRecord,
    ) -> Pin<Box<dyn Future<Output = Result<bool, CompletionError>> + Send + '_>> {
        Box::pin(async move {
            let key = self.keys.completions(record.request_id);
            let body = serde_json::to_string(&record)
                .map_err(|e| CompletionError::Serialization(e.to_string()))?;

            // Insert and expiry in one transaction, so no hash is left
            // without a TTL. A duplicate re-applies the same deadline.
            let mut conn = self.conn_manager.clone();
            let (inserted,): (bool,) = redis::pipe()
                .atomic()
                .hset_nx(&key, record.worker_identity.as_str(), body)
                .cmd("EXPIREAT")
                .arg(&key)
                .arg(record.expires_at.timestamp() + 1)
                .ignore()
                .query_async(&mut conn)
                .await
                .map_err(|e| unavailable(&e))?;
            Ok(inserted)
        })
    }

    fn get(
        &self,
        request_id: RequestId,
        worker: &WorkerIdentity,
    ) -> Pin<Box<dyn Future<Output = Result<Option<CompletionRecord>, CompletionError>> + Send + '_>>
    {
        let worker = worker.clone();
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let body: Option<String> = conn
                .hget(self.keys.completions(request_id), worker.as_str())
                .await
                .map_err(|e| unavailable(&e))?;
            body.map(|b| decode(&b)).transpose()
        })
    }

    fn list(
        &self,
        request_id: RequestId,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<CompletionRecord>, CompletionError>> + Send + '_>>
    {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let all: BTreeMap<String, String> = conn
                .hgetall(self.keys.completions(request_id))
                .await
                .map_err(|e| unavailable(&e))?;
            all.values().map(|b| decode(b)).collect()
        })
    }

    fn sweep(
        &self,
        _now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<usize, CompletionError>> + Send + '_>> {
        // Hashes carry EXPIREAT; Redis removes them.
        Box::pin(async { Ok(0) })
    }
}

fn unavailable(e: &RedisError) -> CompletionError {
    CompletionError::Unavailable(e.to_string())
}

fn decode(body: &str) -> Result<CompletionRecord, CompletionError> {
    serde_json::from_str(body).map_err(|e| CompletionError::Serialization(e.to_string()))
}
