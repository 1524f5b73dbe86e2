//! Redis [`RequestStore`].
//!
//! - **Record**: `storage:{id}` → JSON [`WorkRequest`], `SET NX EXAT expires_at`
//! - **Expiry index**: `storage:expiry` (sorted set, score = `expires_at` seconds)
//!
//! Both are written by one Lua script. Redis removes expired records by
//! itself; [`RequestStore::sweep`] trims the index and deletes anything Redis
//! has not evicted yet, reporting only the records it deleted.

use crate::KeyLayout;
use chrono::{DateTime, Utc};
use prscan_core::environment::{Clock, SystemClock};
use prscan_core::{RequestId, RequestStore, RequestStoreError, WorkRequest};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// [`RequestStore`] backed by Redis keys with native expiry.
#[derive(Clone)]
pub struct RedisRequestStore {
    conn_manager: ConnectionManager,
    keys: KeyLayout,
    clock: Arc<dyn Clock>,
}

impl RedisRequestStore {
    pub(crate) fn new(conn_manager: ConnectionManager, keys: KeyLayout) -> Self {
        Self {
            conn_manager,
            keys,
            clock: Arc::new(SystemClock),
        }
    }

    /// Use `clock` to decide whether a record has expired on read.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

impl RequestStore for RedisRequestStore {
    fn put(
        &self,
        request: WorkRequest,
    ) -> Pin<Box<dyn Future<Output = Result<(), RequestStoreError>> + Send + '_>> {
        Box::pin(async move {
            let key = self.keys.request(request.id);
            let body = serde_json::to_string(&request)
                .map_err(|e| RequestStoreError::Serialization(e.to_string()))?;
            let expires_at = expiry_seconds(request.expires_at);

            // Record and index entry go in together: a record missing from the
            // index would never be swept.
            let script = redis::Script::new(
                r"
                if redis.call('SET', KEYS[1], ARGV[1], 'NX', 'EXAT', ARGV[2]) then
                    redis.call('ZADD', KEYS[2], ARGV[2], ARGV[3])
                    return 1
                end
                return 0
                ",
            );
            let mut conn = self.conn_manager.clone();
            let stored: bool = script
                .key(&key)
                .key(self.keys.expiry_index())
                .arg(body)
                .arg(expires_at)
                .arg(request.id.to_string())
                .invoke_async(&mut conn)
                .await
                .map_err(|e| unavailable(&e))?;
            if !stored {
                return Err(RequestStoreError::AlreadyExists(request.id));
            }

            tracing::debug!(request_id = %request.id, expires_at = %request.expires_at, "Stored request");
            Ok(())
        })
    }

    fn get(
        &self,
        id: RequestId,
    ) -> Pin<Box<dyn Future<Output = Result<WorkRequest, RequestStoreError>> + Send + '_>> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let body: Option<String> = conn
                .get(self.keys.request(id))
                .await
                .map_err(|e| unavailable(&e))?;
            let Some(body) = body else {
                return Err(RequestStoreError::NotFound(id));
            };

            let request: WorkRequest = serde_json::from_str(&body)
                .map_err(|e| RequestStoreError::Serialization(e.to_string()))?;
            // EXAT has one-second resolution.
            if request.is_expired(self.clock.now()) {
                return Err(RequestStoreError::NotFound(id));
            }
            Ok(request)
        })
    }

    fn delete(
        &self,
        id: RequestId,
    ) -> Pin<Box<dyn Future<Output = Result<(), RequestStoreError>> + Send + '_>> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let _: () = redis::pipe()
                .atomic()
                .del(self.keys.request(id))
                .ignore()
                .zrem(self.keys.expiry_index(), id.to_string())
                .ignore()
                .query_async(&mut conn)
                .await
                .map_err(|e| unavailable(&e))?;
            Ok(())
        })
    }

    fn sweep(
        &self,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<usize, RequestStoreError>> + Send + '_>> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let index = self.keys.expiry_index();
            let cutoff = now.timestamp();
            let expired: Vec<String> = conn
                .zrangebyscore(&index, "-inf", cutoff)
                .await
                .map_err(|e| unavailable(&e))?;
            if expired.is_empty() {
                return Ok(0);
            }

            let mut pipe = redis::pipe();
            pipe.atomic();
            for id in &expired {
                pipe.del(self.keys.request_raw(id));
            }
            pipe.zrembyscore(&index, "-inf", cutoff).ignore();
            let deleted: Vec<i64> = pipe
                .query_async(&mut conn)
                .await
                .map_err(|e| unavailable(&e))?;

            // Most records are already gone through EXAT; count only our deletes.
            let removed = deleted.iter().filter(|n| **n > 0).count();
            tracing::debug!(indexed = expired.len(), removed, "Swept expired requests");
            Ok(removed)
        })
    }

    fn ping(&self) -> Pin<Box<dyn Future<Output = Result<(), RequestStoreError>> + Send + '_>> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let _: String = redis::cmd("PING")
                .query_async(&mut conn)
                .await
                .map_err(|e| unavailable(&e))?;
            Ok(())
        })
    }
}

fn unavailable(e: &RedisError) -> RequestStoreError {
    RequestStoreError::Unavailable(e.to_string())
}

/// Unix seconds, rounded up so Redis never evicts before `expires_at`.
fn expiry_seconds(expires_at: DateTime<Utc>) -> i64 {
    let secs = expires_at.timestamp();
    if expires_at.timestamp_subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}
