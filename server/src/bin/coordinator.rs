//! Fan-out coordinator.
//!
//! This binary:
//! - Connects to Redis (request store, stream log, completion ledger)
//! - Optionally connects to `PostgreSQL` for dead letters
//! - Serves the HTTP API
//! - Runs the retention sweeper until shutdown
//!
//! # Usage
//!
//! ```bash
//! REDIS_URL=redis://localhost:6379 \
//! CALLBACK_URL=http://coordinator:8000/callbacks \
//! DEFAULT_STREAMS=worker-kics,worker-blackduck \
//! cargo run --bin coordinator
//! ```

use anyhow::Context;
use prscan_core::{CompletionLedger, DeadLetterSink, RequestStore, StreamLog};
use prscan_postgres::PostgresDeadLetterSink;
use prscan_redis::RedisBackend;
use prscan_runtime::metrics::MetricsServer;
use prscan_runtime::{CallbackCorrelator, Dispatcher, RetentionSweeper};
use prscan_server::{AppState, Config, Shutdown, build_router, init_tracing, shutdown_signal};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    let _ = dotenvy::dotenv();

    init_tracing();
    tracing::info!("Starting prscan coordinator...");

    let config = Config::from_env()?;
    tracing::info!(
        redis = %config.redis.url,
        dead_letters = config.database_url.is_some(),
        default_streams = config.coordinator.default_streams.len(),
        "Configuration loaded"
    );

    let backend = RedisBackend::connect(&config.redis.url)
        .await
        .context("connecting to Redis")?
        .with_key_prefix(config.redis.key_prefix.clone());
    let store: Arc<dyn RequestStore> = Arc::new(backend.request_store());
    let log: Arc<dyn StreamLog> = Arc::new(backend.stream_log());
    let ledger: Arc<dyn CompletionLedger> = Arc::new(backend.completion_ledger());
    tracing::info!("✓ Redis connected");

    let dead_letters: Option<Arc<dyn DeadLetterSink>> = match &config.database_url {
        Some(url) => {
            let pool = prscan_postgres::connect(url)
                .await
                .context("connecting to PostgreSQL")?;
            prscan_postgres::run_migrations(&pool)
                .await
                .context("running dead-letter migrations")?;
            tracing::info!("✓ Dead-letter database ready");
            Some(Arc::new(PostgresDeadLetterSink::new(pool)))
        }
        None => None,
    };

    let mut metrics = MetricsServer::new(
        config
            .bind_address()
            .parse()
            .context("parsing HOST/PORT")?,
    );
    metrics.start()?;

    let dispatcher = Dispatcher::new(
        Arc::clone(&store),
        Arc::clone(&log),
        config.coordinator.dispatcher_config(),
    );
    let correlator = CallbackCorrelator::new(Arc::clone(&store), Arc::clone(&ledger))
        .retire_on_completion(config.coordinator.retire_on_completion);

    let mut shutdown = Shutdown::new();
    let mut sweeper =
        RetentionSweeper::new(Arc::clone(&store), config.coordinator.sweep_interval())
            .with_ledger(Arc::clone(&ledger));
    if let Some(sink) = &dead_letters {
        sweeper = sweeper.with_dead_letter_sink(Arc::clone(sink));
    }
    let sweep_rx = shutdown.subscribe();
    shutdown.track(
        "retention-sweeper",
        tokio::spawn(async move { sweeper.run(sweep_rx).await }),
    );

    let mut state = AppState::new(dispatcher, correlator, Arc::clone(&store), Arc::clone(&log))
        .with_default_streams(config.coordinator.default_streams.clone())
        .with_metrics(Arc::new(metrics));
    if let Some(sink) = dead_letters {
        state = state.with_dead_letters(sink);
    }
    let app = build_router(state);

    let address = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("binding {address}"))?;
    tracing::info!(address = %address, "HTTP server listening for requests");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("HTTP server stopped, initiating graceful shutdown...");
    shutdown.drain(config.shutdown_timeout()).await;
    tracing::info!("Graceful shutdown complete");
    Ok(())
}
