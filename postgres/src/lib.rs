//! `PostgreSQL` dead-letter sink for prscan.
//!
//! Poison messages outlive the stream they were appended to, so they are kept
//! in a relational store where operators can list, replay and discard them.
//! This crate provides [`PostgresDeadLetterSink`], an implementation of the
//! `DeadLetterSink` trait from `prscan-core`, plus the schema it needs.
//!
//! # Example
//!
//! ```ignore
//! use prscan_postgres::PostgresDeadLetterSink;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = prscan_postgres::connect("postgres://localhost/prscan").await?;
//!     prscan_postgres::run_migrations(&pool).await?;
//!     let sink = PostgresDeadLetterSink::new(pool);
//!     Ok(())
//! }
//! ```

mod dead_letter_sink;

pub use dead_letter_sink::PostgresDeadLetterSink;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Schema statements, applied in order. Each one is idempotent.
pub const MIGRATIONS: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS delivery_failures (
        id BIGSERIAL PRIMARY KEY,
        stream TEXT NOT NULL,
        entry_id TEXT NOT NULL,
        attempt INTEGER NOT NULL,
        consumer TEXT NOT NULL,
        error TEXT NOT NULL,
        failed_at TIMESTAMPTZ NOT NULL
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_delivery_failures_entry ON delivery_failures(stream, entry_id)",
    r"
    CREATE TABLE IF NOT EXISTS dead_letters (
        stream TEXT NOT NULL,
        entry_id TEXT NOT NULL,
        group_name TEXT NOT NULL,
        message JSONB NOT NULL,
        delivery_count INTEGER NOT NULL,
        failure_history JSONB NOT NULL DEFAULT '[]',
        dead_lettered_at TIMESTAMPTZ NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        resolved_at TIMESTAMPTZ,
        resolved_by TEXT,
        resolution_notes TEXT,
        PRIMARY KEY (stream, entry_id)
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_dead_letters_status ON dead_letters(status, dead_lettered_at)",
];

/// Open a connection pool.
///
/// # Errors
///
/// Returns the driver error if the URL is invalid or the database is
/// unreachable.
pub async fn connect(database_url: &str) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await?;
    tracing::info!("Connected to dead-letter database");
    Ok(pool)
}

/// Apply [`MIGRATIONS`].
///
/// # Errors
///
/// Returns the first statement that fails.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    for statement in MIGRATIONS {
        sqlx::query(statement).execute(pool).await?;
    }
    tracing::debug!(statements = MIGRATIONS.len(), "Dead-letter schema ready");
    Ok(())
}
