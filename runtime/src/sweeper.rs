//! Retention sweep.
//!
//! Stored requests and completion records expire; backends without native
//! expiry need something to remove them. The sweeper also refreshes the
//! pending dead-letter gauge each pass.

use crate::metrics::RetentionMetrics;
use prscan_core::environment::{Clock, SystemClock};
use prscan_core::{CompletionLedger, DeadLetterSink, RequestStore, RequestStoreError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Removals in one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Expired requests removed
    pub requests: usize,
    /// Expired completion records removed
    pub completions: usize,
}

/// Periodically removes expired records.
pub struct RetentionSweeper {
    store: Arc<dyn RequestStore>,
    ledger: Option<Arc<dyn CompletionLedger>>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl RetentionSweeper {
    /// Sweep `store` every `interval`.
    #[must_use]
    pub fn new(store: Arc<dyn RequestStore>, interval: Duration) -> Self {
        Self {
            store,
            ledger: None,
            dead_letters: None,
            clock: Arc::new(SystemClock),
            interval,
        }
    }

    /// Also sweep completion records.
    #[must_use]
    pub fn with_ledger(mut self, ledger: Arc<dyn CompletionLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Report the pending dead-letter count each pass.
    #[must_use]
    pub fn with_dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    /// Use `clock` to decide what has expired.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Run one pass.
    ///
    /// A ledger failure is logged and does not fail the pass.
    ///
    /// # Errors
    ///
    /// Returns the request store error, if any.
    pub async fn sweep_once(&self) -> Result<SweepReport, RequestStoreError> {
        let now = self.clock.now();
        let requests = self.store.sweep(now).await?;
        RetentionMetrics::record_swept("requests", requests);

        let completions = match &self.ledger {
            Some(ledger) => ledger.sweep(now).await.unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Completion sweep failed");
                0
            }),
            None => 0,
        };
        RetentionMetrics::record_swept("completions", completions);

        if let Some(sink) = &self.dead_letters {
            match sink.count_pending().await {
                Ok(pending) => RetentionMetrics::record_dead_letters_pending(pending),
                Err(e) => tracing::warn!(error = %e, "Could not count pending dead letters"),
            }
        }

        let report = SweepReport {
            requests,
            completions,
        };
        if requests > 0 || completions > 0 {
            tracing::info!(requests, completions, "Expired records removed");
        }
        Ok(report)
    }

    /// Sweep every interval until `shutdown` becomes `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(interval_secs = self.interval.as_secs(), "Retention sweeper started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        tracing::error!(error = %e, "Retention sweep failed");
                    }
                }
                // The `watch::Ref` must not outlive this arm or the future is !Send.
                () = async {
                    let _ = shutdown.wait_for(|stop| *stop).await;
                } => break,
            }
        }
        tracing::info!("Retention sweeper stopped");
    }
}
