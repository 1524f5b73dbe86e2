//! Prometheus metrics for observability and monitoring.
//!
//! Metric families:
//! - `prscan_dispatch_*`: requests dispatched and messages appended
//! - `prscan_worker_*`: deliveries processed, reclaimed, dead-lettered
//! - `prscan_callbacks_*`: correlated completions by outcome
//! - `prscan_sweep_*`: retention sweep removals
//! - `prscan_retry_*`: retries of outbound calls
//!
//! # Example
//!
//! ```rust,no_run
//! use prscan_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Serve `server.render()` from the HTTP layer at /metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use prscan_core::StreamName;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus recorder plus the address its scrape endpoint is served on.
///
/// The recorder is process-global; the HTTP layer renders it.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server for `addr` (e.g., `0.0.0.0:9090`).
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Describe all metrics and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a recorder is already installed (e.g., in tests) this logs a warning
    /// and succeeds without a handle.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
                    60.0, 300.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Address the scrape endpoint should listen on.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this instance did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    describe_counter!(
        "prscan_dispatch_requests_total",
        "Dispatch calls by outcome (ok, partial_fanout, store_unavailable, rejected)"
    );
    describe_counter!(
        "prscan_dispatch_messages_appended_total",
        "Envelopes appended, by stream"
    );
    describe_histogram!(
        "prscan_dispatch_duration_seconds",
        "Time to store a request and fan it out"
    );

    describe_counter!(
        "prscan_worker_deliveries_total",
        "Deliveries handled, by stream and outcome (acked, failed, dead_lettered, dropped)"
    );
    describe_counter!(
        "prscan_worker_reclaimed_total",
        "Pending entries taken over from idle consumers"
    );
    describe_counter!(
        "prscan_worker_storage_errors_total",
        "Stream log errors inside the worker loop"
    );
    describe_histogram!(
        "prscan_worker_handler_duration_seconds",
        "Handler (scan) duration"
    );

    describe_counter!("prscan_callbacks_total", "Completion callbacks by outcome");

    describe_counter!(
        "prscan_sweep_removed_total",
        "Records removed by the retention sweep, by kind"
    );
    describe_gauge!(
        "prscan_dead_letters_pending",
        "Dead letters awaiting an operator"
    );

    describe_counter!("prscan_retry_attempts_total", "Total number of retry attempts");
    describe_counter!(
        "prscan_retry_successes_total",
        "Operations that succeeded after at least one retry"
    );
    describe_counter!(
        "prscan_retry_exhausted_total",
        "Operations that failed after exhausting retries"
    );
}

/// Dispatcher metrics recorder.
pub struct DispatchMetrics;

impl DispatchMetrics {
    /// Record a dispatch outcome.
    pub fn record_outcome(outcome: &'static str, duration: Duration) {
        counter!("prscan_dispatch_requests_total", "outcome" => outcome).increment(1);
        histogram!("prscan_dispatch_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record an appended envelope.
    pub fn record_append(stream: &StreamName) {
        counter!("prscan_dispatch_messages_appended_total", "stream" => stream.to_string())
            .increment(1);
    }
}

/// Worker loop metrics recorder.
pub struct WorkerMetrics;

impl WorkerMetrics {
    /// Record a handled delivery.
    pub fn record_delivery(stream: &StreamName, outcome: &'static str) {
        counter!(
            "prscan_worker_deliveries_total",
            "stream" => stream.to_string(),
            "outcome" => outcome
        )
        .increment(1);
    }

    /// Record reclaimed entries.
    pub fn record_reclaimed(stream: &StreamName, count: usize) {
        counter!("prscan_worker_reclaimed_total", "stream" => stream.to_string())
            .increment(count as u64);
    }

    /// Record handler duration.
    pub fn record_handler(stream: &StreamName, duration: Duration) {
        histogram!("prscan_worker_handler_duration_seconds", "stream" => stream.to_string())
            .record(duration.as_secs_f64());
    }

    /// Record a storage error.
    pub fn record_storage_error(stream: &StreamName) {
        counter!("prscan_worker_storage_errors_total", "stream" => stream.to_string())
            .increment(1);
    }
}

/// Callback correlator metrics recorder.
pub struct CallbackMetrics;

impl CallbackMetrics {
    /// Record a correlation outcome.
    pub fn record_outcome(outcome: &'static str) {
        counter!("prscan_callbacks_total", "outcome" => outcome).increment(1);
    }
}

/// Retention sweep and dead-letter metrics recorder.
pub struct RetentionMetrics;

impl RetentionMetrics {
    /// Record removed records of one kind.
    pub fn record_swept(kind: &'static str, count: usize) {
        counter!("prscan_sweep_removed_total", "kind" => kind).increment(count as u64);
    }

    /// Record the number of dead letters awaiting an operator.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_dead_letters_pending(count: u64) {
        gauge!("prscan_dead_letters_pending").set(count as f64);
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a retry attempt.
    pub fn record_attempt() {
        counter!("prscan_retry_attempts_total").increment(1);
    }

    /// Record a successful retry.
    pub fn record_success() {
        counter!("prscan_retry_successes_total").increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted() {
        counter!("prscan_retry_exhausted_total").increment(1);
    }
}
