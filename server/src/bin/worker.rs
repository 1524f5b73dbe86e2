//! Scan worker.
//!
//! One process consumes one stream as one member of a consumer group:
//! - Reclaims messages left pending by crashed consumers
//! - Runs `SCAN_COMMAND` for every request it reads
//! - Posts the result to the request's callback address
//! - Buries poison messages in `PostgreSQL` when `DATABASE_URL` is set
//!
//! `/status` and `/metrics` are served on `METRICS_PORT`.
//!
//! # Usage
//!
//! ```bash
//! REDIS_URL=redis://localhost:6379 \
//! STREAM_NAME=worker-kics \
//! SCAN_COMMAND="/opt/scan/run.sh" \
//! cargo run --bin worker
//! ```

use anyhow::Context;
use prscan_core::{DeadLetterSink, RequestStore, StreamLog};
use prscan_postgres::PostgresDeadLetterSink;
use prscan_redis::RedisBackend;
use prscan_runtime::metrics::MetricsServer;
use prscan_runtime::{HttpCallbackNotifier, ScanHandler, Subscription, WorkerLoop};
use prscan_server::{Config, OpsState, Shutdown, init_tracing, ops_router, shutdown_signal, stopped};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    let _ = dotenvy::dotenv();

    init_tracing();

    let config = Config::from_env()?;
    let worker = &config.worker;
    tracing::info!(
        stream = %worker.stream,
        group = %worker.group,
        consumer = %worker.consumer,
        identity = %worker.identity,
        "Starting prscan worker..."
    );
    let scanner = worker.scanner()?;

    let backend = RedisBackend::connect(&config.redis.url)
        .await
        .context("connecting to Redis")?
        .with_key_prefix(config.redis.key_prefix.clone());
    let store: Arc<dyn RequestStore> = Arc::new(backend.request_store());
    let log: Arc<dyn StreamLog> = Arc::new(backend.stream_log());

    let dead_letters: Option<Arc<dyn DeadLetterSink>> = match &config.database_url {
        Some(url) => {
            let pool = prscan_postgres::connect(url)
                .await
                .context("connecting to PostgreSQL")?;
            prscan_postgres::run_migrations(&pool)
                .await
                .context("running dead-letter migrations")?;
            Some(Arc::new(PostgresDeadLetterSink::new(pool)))
        }
        None => None,
    };

    let notifier = HttpCallbackNotifier::new()?
        .with_default_address(config.coordinator.callback_url.clone());
    let mut handler = ScanHandler::new(
        Arc::clone(&store),
        Arc::new(scanner),
        Arc::new(notifier),
        worker.identity.clone(),
    );
    if let Some(dir) = &worker.workspace_dir {
        handler = handler.with_workspace_root(dir.clone());
    }

    let subscription = Subscription::new(
        worker.stream.clone(),
        worker.group.clone(),
        worker.consumer.clone(),
    );
    let mut worker_loop = WorkerLoop::new(
        Arc::clone(&log),
        subscription,
        Arc::new(handler),
        worker.poll_config(),
    );
    if let Some(sink) = &dead_letters {
        worker_loop = worker_loop.with_dead_letter_sink(Arc::clone(sink));
    }
    let worker_loop = Arc::new(worker_loop);

    let address = config.metrics_address();
    let mut metrics = MetricsServer::new(address.parse().context("parsing HOST/METRICS_PORT")?);
    metrics.start()?;

    let mut ops = OpsState::new(Arc::clone(&store), Arc::clone(&log))
        .with_metrics(Arc::new(metrics))
        .with_worker_phase(worker_loop.watch_phase());
    if let Some(sink) = dead_letters {
        ops = ops.with_dead_letters(sink);
    }
    let ops_app = ops_router::<OpsState>()
        .layer(TraceLayer::new_for_http())
        .with_state(ops);

    let mut shutdown = Shutdown::new();

    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("binding {address}"))?;
    tracing::info!(address = %address, "Ops listener serving /status and /metrics");
    let ops_rx = shutdown.subscribe();
    shutdown.track(
        "ops-listener",
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, ops_app)
                .with_graceful_shutdown(stopped(ops_rx))
                .await
            {
                tracing::error!(error = %e, "Ops listener failed");
            }
        }),
    );

    let worker_rx = shutdown.subscribe();
    let running = Arc::clone(&worker_loop);
    shutdown.track(
        "worker-loop",
        tokio::spawn(async move { running.run(worker_rx).await }),
    );

    shutdown_signal().await;
    tracing::info!("Stopping worker, waiting for the current message...");
    shutdown.drain(config.shutdown_timeout()).await;
    tracing::info!("Graceful shutdown complete");
    Ok(())
}
