//! Application state shared across all HTTP handlers.

use axum::extract::FromRef;
use prscan_core::{DeadLetterSink, RequestStore, StreamLog, StreamName};
use prscan_runtime::metrics::MetricsServer;
use prscan_runtime::{CallbackCorrelator, DeadLetterReplayer, Dispatcher, WorkerPhase};
use std::sync::Arc;
use tokio::sync::watch;

/// Application state shared across all HTTP handlers.
///
/// Cheap to clone: every component is reference-counted.
#[derive(Clone)]
pub struct AppState {
    /// Stores and fans out triggers
    pub dispatcher: Dispatcher,
    /// Correlates completion callbacks
    pub correlator: CallbackCorrelator,
    /// Request store (health probes)
    pub store: Arc<dyn RequestStore>,
    /// Stream log (health probes)
    pub log: Arc<dyn StreamLog>,
    /// Dead-letter sink, when a dead-letter database is configured
    pub dead_letters: Option<Arc<dyn DeadLetterSink>>,
    /// Streams used when a trigger names none
    pub default_streams: Vec<StreamName>,
    /// Prometheus recorder, when installed by this process
    pub metrics: Option<Arc<MetricsServer>>,
}

impl AppState {
    /// Create state over the given backends, without dead letters or metrics.
    #[must_use]
    pub fn new(
        dispatcher: Dispatcher,
        correlator: CallbackCorrelator,
        store: Arc<dyn RequestStore>,
        log: Arc<dyn StreamLog>,
    ) -> Self {
        Self {
            dispatcher,
            correlator,
            store,
            log,
            dead_letters: None,
            default_streams: Vec::new(),
            metrics: None,
        }
    }

    /// Enable the dead-letter endpoints.
    #[must_use]
    pub fn with_dead_letters(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    /// Fan out to `streams` when a trigger names none.
    #[must_use]
    pub fn with_default_streams(mut self, streams: Vec<StreamName>) -> Self {
        self.default_streams = streams;
        self
    }

    /// Serve `/metrics` from `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<MetricsServer>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Replayer over the configured dead-letter sink.
    #[must_use]
    pub fn replayer(&self) -> Option<DeadLetterReplayer> {
        self.dead_letters
            .as_ref()
            .map(|sink| DeadLetterReplayer::new(Arc::clone(sink), Arc::clone(&self.log)))
    }
}

/// What `/status` and `/metrics` need.
///
/// The coordinator derives it from [`AppState`]; the worker builds one
/// directly for its ops listener.
#[derive(Clone)]
pub struct OpsState {
    /// Request store
    pub store: Arc<dyn RequestStore>,
    /// Stream log
    pub log: Arc<dyn StreamLog>,
    /// Dead-letter sink, if any
    pub dead_letters: Option<Arc<dyn DeadLetterSink>>,
    /// Prometheus recorder, if installed by this process
    pub metrics: Option<Arc<MetricsServer>>,
    /// Phase of the local worker loop (worker process only)
    pub worker_phase: Option<watch::Receiver<WorkerPhase>>,
}

impl OpsState {
    /// Ops state over the two core backends.
    #[must_use]
    pub fn new(store: Arc<dyn RequestStore>, log: Arc<dyn StreamLog>) -> Self {
        Self {
            store,
            log,
            dead_letters: None,
            metrics: None,
            worker_phase: None,
        }
    }

    /// Include pending dead letters in the health report.
    #[must_use]
    pub fn with_dead_letters(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    /// Serve `/metrics` from `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<MetricsServer>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Report the phase of a worker loop.
    #[must_use]
    pub fn with_worker_phase(mut self, phase: watch::Receiver<WorkerPhase>) -> Self {
        self.worker_phase = Some(phase);
        self
    }
}

impl FromRef<AppState> for OpsState {
    fn from_ref(state: &AppState) -> Self {
        Self {
            store: Arc::clone(&state.store),
            log: Arc::clone(&state.log),
            dead_letters: state.dead_letters.clone(),
            metrics: state.metrics.clone(),
            worker_phase: None,
        }
    }
}
