//! Redis streams [`StreamLog`].
//!
//! | Operation | Redis |
//! |-----------|-------|
//! | append | `XADD stream * data <json>` |
//! | read_group | `XREADGROUP GROUP g c COUNT n [BLOCK ms] STREAMS stream >` |
//! | ack | `XACK` |
//! | delete | `XDEL` |
//! | reclaim | `XPENDING ... IDLE ms` then `XCLAIM` |
//! | pending | `XPENDING stream group - + n` |
//!
//! `read_group` runs on its own connection so a `BLOCK` wait does not stall
//! the other commands.
//!
//! Groups are created on first use with `XGROUP CREATE ... 0 MKSTREAM`, so a
//! new group starts at the beginning of the stream.

use crate::KeyLayout;
use chrono::Utc;
use prscan_core::{
    ConsumerName, Delivery, EntryId, GroupName, PendingEntry, StreamLog, StreamLogError,
    StreamMessage, StreamName,
};
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamRangeReply, StreamReadOptions,
    StreamReadReply,
};
use redis::{AsyncCommands, RedisError};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Most pending entries returned by one [`StreamLog::pending`] call.
const PENDING_PAGE: usize = 10_000;

/// [`StreamLog`] backed by Redis streams.
#[derive(Clone)]
pub struct RedisStreamLog {
    conn_manager: ConnectionManager,
    blocking_manager: ConnectionManager,
    keys: KeyLayout,
}

impl RedisStreamLog {
    pub(crate) const fn new(
        conn_manager: ConnectionManager,
        blocking_manager: ConnectionManager,
        keys: KeyLayout,
    ) -> Self {
        Self {
            conn_manager,
            blocking_manager,
            keys,
        }
    }

    /// Create the group at the start of the stream; an existing group is fine.
    async fn ensure_group(&self, stream: &str, group: &GroupName) -> Result<(), StreamLogError> {
        let mut conn = self.conn_manager.clone();
        let created: Result<(), RedisError> =
            conn.xgroup_create_mkstream(stream, group.as_str(), "0").await;
        match created {
            Ok(()) => {
                tracing::info!(stream, group = %group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(unavailable(&e)),
        }
    }

    async fn read_once(
        &self,
        stream: &str,
        options: &StreamReadOptions,
    ) -> Result<Option<StreamReadReply>, RedisError> {
        let mut conn = self.blocking_manager.clone();
        conn.xread_options(&[stream], &[">"], options).await
    }

    /// Decode entries, dropping the ones that cannot be decoded.
    async fn decode_batch(
        &self,
        stream: &StreamName,
        group: &GroupName,
        consumer: &ConsumerName,
        entries: Vec<StreamId>,
        delivery_counts: &HashMap<String, u32>,
    ) -> Result<Vec<Delivery>, StreamLogError> {
        let mut batch = Vec::with_capacity(entries.len());
        for entry in entries {
            let entry_id = parse_id(stream, &entry.id)?;
            match decode_body(stream, entry_id, &entry) {
                Ok(message) => batch.push(Delivery {
                    entry_id,
                    message,
                    consumer: consumer.clone(),
                    delivery_count: delivery_counts.get(&entry.id).copied().unwrap_or(1),
                }),
                Err(e) => {
                    tracing::error!(stream = %stream, entry_id = %entry_id, error = %e, "Dropping undecodable entry");
                    self.ack(stream, group, entry_id).await?;
                    self.delete(stream, entry_id).await?;
                }
            }
        }
        Ok(batch)
    }
}

impl StreamLog for RedisStreamLog {
    fn append(
        &self,
        stream: &StreamName,
        message: StreamMessage,
    ) -> Pin<Box<dyn Future<Output = Result<EntryId, StreamLogError>> + Send + '_>> {
        let key = self.keys.stream(stream);
        let stream = stream.clone();
        Box::pin(async move {
            let key = key?;
            let body = message
                .encode()
                .map_err(|e| StreamLogError::Serialization(e.to_string()))?;
            let mut conn = self.conn_manager.clone();
            let id: String = conn
                .xadd(&key, "*", &[(StreamMessage::FIELD, body)])
                .await
                .map_err(|e| unavailable(&e))?;
            let entry_id = parse_id(&stream, &id)?;
            tracing::debug!(stream = %stream, entry_id = %entry_id, request_id = %message.request_id, "Appended");
            Ok(entry_id)
        })
    }

    fn read_group(
        &self,
        stream: &StreamName,
        group: &GroupName,
        consumer: &ConsumerName,
        max_count: usize,
        block_timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Delivery>, StreamLogError>> + Send + '_>> {
        let key = self.keys.stream(stream);
        let stream = stream.clone();
        let group = group.clone();
        let consumer = consumer.clone();
        Box::pin(async move {
            let key = key?;
            let mut options = StreamReadOptions::default()
                .group(group.as_str(), consumer.as_str())
                .count(max_count.max(1));
            // BLOCK 0 would wait forever.
            #[allow(clippy::cast_possible_truncation)] // Block timeouts are seconds, not eons
            let block_ms = block_timeout.as_millis() as usize;
            if block_ms > 0 {
                options = options.block(block_ms);
            }

            let reply = match self.read_once(&key, &options).await {
                Err(e) if e.code() == Some("NOGROUP") => {
                    self.ensure_group(&key, &group).await?;
                    self.read_once(&key, &options).await
                }
                other => other,
            }
            .map_err(|e| unavailable(&e))?;

            let entries = reply
                .map(|r| r.keys.into_iter().flat_map(|k| k.ids).collect())
                .unwrap_or_default();
            self.decode_batch(&stream, &group, &consumer, entries, &HashMap::new())
                .await
        })
    }

    fn ack(
        &self,
        stream: &StreamName,
        group: &GroupName,
        entry_id: EntryId,
    ) -> Pin<Box<dyn Future<Output = Result<(), StreamLogError>> + Send + '_>> {
        let key = self.keys.stream(stream);
        let group = group.clone();
        Box::pin(async move {
            let key = key?;
            let mut conn = self.conn_manager.clone();
            let acked: Result<i64, RedisError> =
                conn.xack(&key, group.as_str(), &[entry_id.to_string()]).await;
            match acked {
                // Unknown groups and streams are a no-op.
                Err(e) if e.code() == Some("NOGROUP") => Ok(()),
                Err(e) => Err(unavailable(&e)),
                Ok(_) => Ok(()),
            }
        })
    }

    fn delete(
        &self,
        stream: &StreamName,
        entry_id: EntryId,
    ) -> Pin<Box<dyn Future<Output = Result<(), StreamLogError>> + Send + '_>> {
        let key = self.keys.stream(stream);
        Box::pin(async move {
            let key = key?;
            let mut conn = self.conn_manager.clone();
            let _: i64 = conn
                .xdel(&key, &[entry_id.to_string()])
                .await
                .map_err(|e| unavailable(&e))?;
            Ok(())
        })
    }

    fn reclaim(
        &self,
        stream: &StreamName,
        group: &GroupName,
        consumer: &ConsumerName,
        min_idle: Duration,
        max_count: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Delivery>, StreamLogError>> + Send + '_>> {
        let key = self.keys.stream(stream);
        let stream = stream.clone();
        let group = group.clone();
        let consumer = consumer.clone();
        Box::pin(async move {
            let key = key?;
            #[allow(clippy::cast_possible_truncation)]
            let idle_ms = min_idle.as_millis() as usize;
            let mut conn = self.conn_manager.clone();

            let candidates: Result<StreamPendingCountReply, RedisError> = redis::cmd("XPENDING")
                .arg(&key)
                .arg(group.as_str())
                .arg("IDLE")
                .arg(idle_ms)
                .arg("-")
                .arg("+")
                .arg(max_count.max(1))
                .query_async(&mut conn)
                .await;
            let candidates = match candidates {
                Ok(reply) => reply.ids,
                Err(e) if e.code() == Some("NOGROUP") => return Ok(Vec::new()),
                Err(e) => return Err(unavailable(&e)),
            };
            if candidates.is_empty() {
                return Ok(Vec::new());
            }

            let ids: Vec<&str> = candidates.iter().map(|p| p.id.as_str()).collect();
            // XCLAIM re-checks the idle time, so a racing consumer wins cleanly.
            let claimed: StreamClaimReply = conn
                .xclaim(&key, group.as_str(), consumer.as_str(), idle_ms, ids.as_slice())
                .await
                .map_err(|e| unavailable(&e))?;

            let counts: HashMap<String, u32> = candidates
                .iter()
                .map(|p| {
                    let count = u32::try_from(p.times_delivered).unwrap_or(u32::MAX);
                    (p.id.clone(), count.saturating_add(1))
                })
                .collect();

            // Candidates XCLAIM did not return were deleted (or taken by another
            // consumer). Drop deleted ones from the pending set.
            for pending in &candidates {
                if claimed.ids.iter().any(|c| c.id == pending.id) {
                    continue;
                }
                let still_there: StreamRangeReply = conn
                    .xrange(&key, &pending.id, &pending.id)
                    .await
                    .map_err(|e| unavailable(&e))?;
                if still_there.ids.is_empty() {
                    let entry_id = parse_id(&stream, &pending.id)?;
                    tracing::info!(stream = %stream, entry_id = %entry_id, "Dropping pending entry of deleted message");
                    self.ack(&stream, &group, entry_id).await?;
                }
            }

            self.decode_batch(&stream, &group, &consumer, claimed.ids, &counts)
                .await
        })
    }

    fn pending(
        &self,
        stream: &StreamName,
        group: &GroupName,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<PendingEntry>, StreamLogError>> + Send + '_>> {
        let key = self.keys.stream(stream);
        let stream = stream.clone();
        let group = group.clone();
        Box::pin(async move {
            let key = key?;
            let mut conn = self.conn_manager.clone();
            let reply: Result<StreamPendingCountReply, RedisError> = conn
                .xpending_count(&key, group.as_str(), "-", "+", PENDING_PAGE)
                .await;
            let reply = match reply {
                Ok(reply) => reply,
                Err(e) if e.code() == Some("NOGROUP") => return Ok(Vec::new()),
                Err(e) => return Err(unavailable(&e)),
            };

            let now = Utc::now();
            reply
                .ids
                .into_iter()
                .map(|p| {
                    #[allow(clippy::cast_possible_wrap)]
                    let idle = chrono::Duration::milliseconds(p.last_delivered_ms as i64);
                    Ok(PendingEntry {
                        entry_id: parse_id(&stream, &p.id)?,
                        consumer: ConsumerName::new(p.consumer),
                        delivered_at: now - idle,
                        delivery_count: u32::try_from(p.times_delivered).unwrap_or(u32::MAX),
                    })
                })
                .collect()
        })
    }

    fn ping(&self) -> Pin<Box<dyn Future<Output = Result<(), StreamLogError>> + Send + '_>> {
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

fn unavailable(e: &RedisError) -> StreamLogError {
    StreamLogError::Unavailable(e.to_string())
}

fn parse_id(stream: &StreamName, raw: &str) -> Result<EntryId, StreamLogError> {
    raw.parse()
        .map_err(|e| StreamLogError::Unavailable(format!("unexpected entry id {raw:?} in {stream}: {e}")))
}

fn decode_body(
    stream: &StreamName,
    entry_id: EntryId,
    entry: &StreamId,
) -> Result<StreamMessage, StreamLogError> {
    let invalid = |reason: String| StreamLogError::InvalidEntry {
        stream: stream.clone(),
        entry_id,
        reason,
    };
    let body: String = entry
        .get(StreamMessage::FIELD)
        .ok_or_else(|| invalid(format!("missing {:?} field", StreamMessage::FIELD)))?;
    StreamMessage::decode(&body).map_err(|e| invalid(e.to_string()))
}
