//! `PostgreSQL` dead-letter sink.
//!
//! Provides persistent storage for poison messages so operators can
//! investigate, replay or discard them after the worker gave up.
//!
//! Two tables (see [`crate::MIGRATIONS`]):
//!
//! - `delivery_failures`: one row per failed attempt of a message still in
//!   flight
//! - `dead_letters`: one row per buried message, keyed by `(stream, entry_id)`,
//!   with the failure history folded into a JSONB array

use chrono::{DateTime, Utc};
use prscan_core::environment::{Clock, SystemClock};
use prscan_core::{
    Burial, ConsumerName, DeadLetter, DeadLetterError, DeadLetterSink, DeadLetterStatus, EntryId,
    FailureRecord, GroupName, StreamMessage, StreamName,
};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

const LETTER_COLUMNS: &str = r"
    stream, entry_id, group_name, message, delivery_count, failure_history,
    dead_lettered_at, status, resolved_at, resolved_by, resolution_notes
";

/// `PostgreSQL`-backed [`DeadLetterSink`].
///
/// # Example
///
/// ```no_run
/// use prscan_postgres::PostgresDeadLetterSink;
/// use prscan_core::{DeadLetterSink, DeadLetterStatus};
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// prscan_postgres::run_migrations(&pool).await?;
/// let sink = PostgresDeadLetterSink::new(pool);
///
/// let pending = sink.list(Some(DeadLetterStatus::Pending), 100).await?;
/// println!("Pending dead letters: {}", pending.len());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PostgresDeadLetterSink {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl PostgresDeadLetterSink {
    /// Create a sink on the given connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            clock: Arc::new(SystemClock),
        }
    }

    /// Stamp resolutions with `clock`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch(
        &self,
        stream: &StreamName,
        entry_id: EntryId,
    ) -> Result<Option<DeadLetter>, DeadLetterError> {
        let row = sqlx::query(&format!(
            "SELECT {LETTER_COLUMNS} FROM dead_letters WHERE stream = $1 AND entry_id = $2"
        ))
        .bind(stream.as_str())
        .bind(entry_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| unavailable(&e))?;

        row.as_ref().map(row_to_dead_letter).transpose()
    }
}

impl std::fmt::Debug for PostgresDeadLetterSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresDeadLetterSink").finish_non_exhaustive()
    }
}

impl DeadLetterSink for PostgresDeadLetterSink {
    fn record_failure(
        &self,
        stream: &StreamName,
        entry_id: EntryId,
        failure: FailureRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>> {
        let stream = stream.clone();
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO delivery_failures (stream, entry_id, attempt, consumer, error, failed_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ",
            )
            .bind(stream.as_str())
            .bind(entry_id.to_string())
            .bind(to_i32(failure.attempt))
            .bind(failure.consumer.as_str())
            .bind(&failure.error)
            .bind(failure.failed_at)
            .execute(&self.pool)
            .await
            .map_err(|e| unavailable(&e))?;
            Ok(())
        })
    }

    fn clear_failures(
        &self,
        stream: &StreamName,
        entry_id: EntryId,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>> {
        let stream = stream.clone();
        Box::pin(async move {
            sqlx::query("DELETE FROM delivery_failures WHERE stream = $1 AND entry_id = $2")
                .bind(stream.as_str())
                .bind(entry_id.to_string())
                .execute(&self.pool)
                .await
                .map_err(|e| unavailable(&e))?;
            Ok(())
        })
    }

    fn bury(
        &self,
        burial: Burial,
    ) -> Pin<Box<dyn Future<Output = Result<DeadLetter, DeadLetterError>> + Send + '_>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(|e| unavailable(&e))?;

            let rows = sqlx::query(
                r"
                DELETE FROM delivery_failures
                WHERE stream = $1 AND entry_id = $2
                RETURNING attempt, consumer, error, failed_at
                ",
            )
            .bind(burial.stream.as_str())
            .bind(burial.entry_id.to_string())
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| unavailable(&e))?;

            let mut failures = rows
                .iter()
                .map(row_to_failure)
                .collect::<Result<Vec<_>, _>>()?;
            failures.sort_by_key(|f| (f.attempt, f.failed_at));

            let message = serde_json::to_value(&burial.message)
                .map_err(|e| DeadLetterError::Serialization(e.to_string()))?;
            let history = serde_json::to_value(&failures)
                .map_err(|e| DeadLetterError::Serialization(e.to_string()))?;

            sqlx::query(
                r"
                INSERT INTO dead_letters (
                    stream, entry_id, group_name, message, delivery_count,
                    failure_history, dead_lettered_at, status
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending')
                ON CONFLICT (stream, entry_id) DO UPDATE SET
                    group_name = EXCLUDED.group_name,
                    message = EXCLUDED.message,
                    delivery_count = EXCLUDED.delivery_count,
                    failure_history = EXCLUDED.failure_history,
                    dead_lettered_at = EXCLUDED.dead_lettered_at,
                    status = 'pending',
                    resolved_at = NULL,
                    resolved_by = NULL,
                    resolution_notes = NULL
                ",
            )
            .bind(burial.stream.as_str())
            .bind(burial.entry_id.to_string())
            .bind(burial.group.as_str())
            .bind(message)
            .bind(to_i32(burial.delivery_count))
            .bind(history)
            .bind(burial.dead_lettered_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| unavailable(&e))?;

            tx.commit().await.map_err(|e| unavailable(&e))?;

            tracing::warn!(
                stream = %burial.stream,
                entry_id = %burial.entry_id,
                request_id = %burial.message.request_id,
                delivery_count = burial.delivery_count,
                failures = failures.len(),
                "Message added to dead letters"
            );
            metrics::counter!("prscan_dead_letters_buried_total", "stream" => burial.stream.to_string())
                .increment(1);

            Ok(DeadLetter {
                stream: burial.stream,
                entry_id: burial.entry_id,
                group: burial.group,
                message: burial.message,
                delivery_count: burial.delivery_count,
                failures,
                dead_lettered_at: burial.dead_lettered_at,
                status: DeadLetterStatus::Pending,
                resolved_at: None,
                resolved_by: None,
                resolution_notes: None,
            })
        })
    }

    fn list(
        &self,
        status: Option<DeadLetterStatus>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeadLetter>, DeadLetterError>> + Send + '_>> {
        Box::pin(async move {
            #[allow(clippy::cast_possible_wrap)] // Limit is reasonable size, i64 is safe
            let rows = sqlx::query(&format!(
                r"
                SELECT {LETTER_COLUMNS}
                FROM dead_letters
                WHERE $1::TEXT IS NULL OR status = $1
                ORDER BY dead_lettered_at ASC, stream ASC, entry_id ASC
                LIMIT $2
                "
            ))
            .bind(status.map(|s| s.as_str()))
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| unavailable(&e))?;

            rows.iter().map(row_to_dead_letter).collect()
        })
    }

    fn get(
        &self,
        stream: &StreamName,
        entry_id: EntryId,
    ) -> Pin<Box<dyn Future<Output = Result<DeadLetter, DeadLetterError>> + Send + '_>> {
        let stream = stream.clone();
        Box::pin(async move {
            self.fetch(&stream, entry_id)
                .await?
                .ok_or(DeadLetterError::NotFound { stream, entry_id })
        })
    }

    fn resolve(
        &self,
        stream: &StreamName,
        entry_id: EntryId,
        status: DeadLetterStatus,
        resolved_by: String,
        notes: Option<String>,
    ) -> Pin<Box<dyn Future<Output = Result<DeadLetter, DeadLetterError>> + Send + '_>> {
        let stream = stream.clone();
        Box::pin(async move {
            let row = sqlx::query(&format!(
                r"
                UPDATE dead_letters
                SET status = $3,
                    resolved_at = $4,
                    resolved_by = $5,
                    resolution_notes = $6
                WHERE stream = $1 AND entry_id = $2 AND status = 'pending'
                RETURNING {LETTER_COLUMNS}
                "
            ))
            .bind(stream.as_str())
            .bind(entry_id.to_string())
            .bind(status.as_str())
            .bind(self.clock.now())
            .bind(&resolved_by)
            .bind(notes.as_deref())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| unavailable(&e))?;

            let Some(row) = row else {
                // Either missing or no longer pending.
                return Err(match self.fetch(&stream, entry_id).await? {
                    Some(letter) => DeadLetterError::AlreadyResolved {
                        stream,
                        entry_id,
                        status: letter.status,
                    },
                    None => DeadLetterError::NotFound { stream, entry_id },
                });
            };

            tracing::info!(
                stream = %stream,
                entry_id = %entry_id,
                status = status.as_str(),
                resolved_by = %resolved_by,
                "Dead letter resolved"
            );
            metrics::counter!("prscan_dead_letters_resolved_total", "status" => status.as_str())
                .increment(1);

            row_to_dead_letter(&row)
        })
    }

    fn count_pending(&self) -> Pin<Box<dyn Future<Output = Result<u64, DeadLetterError>> + Send + '_>> {
        Box::pin(async move {
            let (count,): (i64,) =
                sqlx::query_as("SELECT COUNT(*) FROM dead_letters WHERE status = 'pending'")
                    .fetch_one(&self.pool)
                    .await
                    .map_err(|e| unavailable(&e))?;
            Ok(u64::try_from(count).unwrap_or_default())
        })
    }
}

fn unavailable(e: &sqlx::Error) -> DeadLetterError {
    DeadLetterError::Unavailable(e.to_string())
}

fn column(e: &sqlx::Error) -> DeadLetterError {
    DeadLetterError::Serialization(e.to_string())
}

fn to_i32(count: u32) -> i32 {
    i32::try_from(count).unwrap_or(i32::MAX)
}

fn to_u32(count: i32) -> u32 {
    u32::try_from(count).unwrap_or_default()
}

fn row_to_failure(row: &PgRow) -> Result<FailureRecord, DeadLetterError> {
    let attempt: i32 = row.try_get("attempt").map_err(|e| column(&e))?;
    let consumer: String = row.try_get("consumer").map_err(|e| column(&e))?;
    Ok(FailureRecord {
        attempt: to_u32(attempt),
        consumer: ConsumerName::new(consumer),
        error: row.try_get("error").map_err(|e| column(&e))?,
        failed_at: row.try_get("failed_at").map_err(|e| column(&e))?,
    })
}

fn row_to_dead_letter(row: &PgRow) -> Result<DeadLetter, DeadLetterError> {
    let stream: String = row.try_get("stream").map_err(|e| column(&e))?;
    let entry_id: String = row.try_get("entry_id").map_err(|e| column(&e))?;
    let group: String = row.try_get("group_name").map_err(|e| column(&e))?;
    let message: serde_json::Value = row.try_get("message").map_err(|e| column(&e))?;
    let delivery_count: i32 = row.try_get("delivery_count").map_err(|e| column(&e))?;
    let history: serde_json::Value = row.try_get("failure_history").map_err(|e| column(&e))?;
    let status: String = row.try_get("status").map_err(|e| column(&e))?;
    let resolved_at: Option<DateTime<Utc>> = row.try_get("resolved_at").map_err(|e| column(&e))?;

    Ok(DeadLetter {
        entry_id: entry_id
            .parse()
            .map_err(|e| DeadLetterError::Serialization(format!("entry id {entry_id:?}: {e}")))?,
        stream: StreamName::new(stream),
        group: GroupName::new(group),
        message: serde_json::from_value::<StreamMessage>(message)
            .map_err(|e| DeadLetterError::Serialization(e.to_string()))?,
        delivery_count: to_u32(delivery_count),
        failures: serde_json::from_value(history)
            .map_err(|e| DeadLetterError::Serialization(e.to_string()))?,
        dead_lettered_at: row.try_get("dead_lettered_at").map_err(|e| column(&e))?,
        status: DeadLetterStatus::parse(&status)?,
        resolved_at,
        resolved_by: row.try_get("resolved_by").map_err(|e| column(&e))?,
        resolution_notes: row.try_get("resolution_notes").map_err(|e| column(&e))?,
    })
}
