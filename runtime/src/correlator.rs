//! Callback correlator.
//!
//! Joins completion notices to stored requests. Each `(request_id,
//! worker_identity)` pair is accepted at most once; redelivered or retried
//! callbacks come back as [`CompletionOutcome::Duplicate`] and change nothing.

use crate::metrics::CallbackMetrics;
use prscan_core::environment::{Clock, SystemClock};
use prscan_core::{
    CompletionError, CompletionLedger, CompletionNotice, CompletionOutcome, CompletionRecord,
    CorrelatedCompletion, RequestId, RequestStore, RequestStoreError, ScanResult, WorkRequest,
    WorkerIdentity,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;

/// Errors returned by [`CallbackCorrelator`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CorrelatorError {
    /// The request store could not be read
    #[error("Request store unavailable: {0}")]
    StoreUnavailable(String),

    /// The completion ledger failed
    #[error(transparent)]
    Ledger(#[from] CompletionError),
}

/// Correlates completions with their requests.
#[derive(Clone)]
pub struct CallbackCorrelator {
    store: Arc<dyn RequestStore>,
    ledger: Arc<dyn CompletionLedger>,
    clock: Arc<dyn Clock>,
    retire_on_completion: bool,
}

impl CallbackCorrelator {
    /// Create a correlator that leaves request retirement to the TTL sweep.
    #[must_use]
    pub fn new(store: Arc<dyn RequestStore>, ledger: Arc<dyn CompletionLedger>) -> Self {
        Self {
            store,
            ledger,
            clock: Arc::new(SystemClock),
            retire_on_completion: false,
        }
    }

    /// Use `clock` for `received_at`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Delete a request as soon as every stream it was fanned out to has
    /// reported. Later notices for it are then [`CompletionOutcome::UnknownRequest`].
    #[must_use]
    pub const fn retire_on_completion(mut self, retire: bool) -> Self {
        self.retire_on_completion = retire;
        self
    }

    /// Correlate a decoded callback body.
    ///
    /// # Errors
    ///
    /// See [`CallbackCorrelator::complete`].
    pub async fn complete_notice(
        &self,
        notice: CompletionNotice,
    ) -> Result<CompletionOutcome, CorrelatorError> {
        let request = match self.store.get(notice.request_id).await {
            Ok(request) => request,
            Err(RequestStoreError::NotFound(id)) => {
                CallbackMetrics::record_outcome("unknown_request");
                tracing::warn!(
                    request_id = %id,
                    worker = %notice.worker_identity,
                    "Completion for unknown or expired request"
                );
                return Ok(CompletionOutcome::UnknownRequest);
            }
            Err(e) => {
                CallbackMetrics::record_outcome("error");
                return Err(CorrelatorError::StoreUnavailable(e.to_string()));
            }
        };

        let record = CompletionRecord::new(notice, &request, self.clock.now());
        let inserted = self.ledger.record(record.clone()).await.inspect_err(|_| {
            CallbackMetrics::record_outcome("error");
        })?;

        if !inserted {
            CallbackMetrics::record_outcome("duplicate");
            tracing::info!(
                request_id = %record.request_id,
                worker = %record.worker_identity,
                "Duplicate completion ignored"
            );
            return Ok(CompletionOutcome::Duplicate);
        }

        let merged = CorrelatedCompletion::merge(&request, &record);
        CallbackMetrics::record_outcome("accepted");
        tracing::info!(
            request_id = %merged.request_id,
            worker = %merged.worker_identity,
            repo = %request.payload.slug(),
            conclusion = ?merged.conclusion,
            summary = %record.result_summary,
            "Completion accepted"
        );

        if self.retire_on_completion {
            self.retire_if_complete(&request).await;
        }

        Ok(CompletionOutcome::Accepted(Box::new(merged)))
    }

    /// Correlate one completion.
    ///
    /// # Errors
    ///
    /// Returns [`CorrelatorError`] if the request store or the ledger fails.
    /// Unknown requests and duplicates are outcomes, not errors.
    pub async fn complete(
        &self,
        request_id: RequestId,
        worker_identity: WorkerIdentity,
        result: ScanResult,
    ) -> Result<CompletionOutcome, CorrelatorError> {
        self.complete_notice(CompletionNotice {
            request_id,
            worker_identity,
            result,
        })
        .await
    }

    /// Completions recorded so far for a request.
    ///
    /// # Errors
    ///
    /// Returns [`CorrelatorError::Ledger`] if the ledger fails.
    pub async fn completions(
        &self,
        request_id: RequestId,
    ) -> Result<Vec<CompletionRecord>, CorrelatorError> {
        Ok(self.ledger.list(request_id).await?)
    }

    async fn retire_if_complete(&self, request: &WorkRequest) {
        let reported = match self.ledger.list(request.id).await {
            Ok(records) => records
                .into_iter()
                .map(|r| r.worker_identity)
                .collect::<BTreeSet<_>>()
                .len(),
            Err(e) => {
                tracing::warn!(request_id = %request.id, error = %e, "Could not count completions");
                return;
            }
        };

        if reported < request.expected_completions as usize {
            return;
        }
        match self.store.delete(request.id).await {
            Ok(()) => tracing::info!(
                request_id = %request.id,
                completions = reported,
                "All streams reported, request retired"
            ),
            // The TTL sweep removes it later.
            Err(e) => tracing::warn!(request_id = %request.id, error = %e, "Failed to retire request"),
        }
    }
}
