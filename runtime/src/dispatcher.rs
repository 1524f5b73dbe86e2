//! Fan-out dispatcher.
//!
//! Turns one trigger into one stored [`WorkRequest`] plus one envelope per
//! target stream. The request is always stored before anything is appended,
//! so a worker never sees an envelope without a backing request.

use crate::metrics::DispatchMetrics;
use prscan_core::environment::{Clock, SystemClock};
use prscan_core::{
    EntryId, RequestId, RequestPayload, RequestStore, RequestStoreError, StreamLog, StreamMessage,
    StreamName, WorkRequest,
};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors returned by [`Dispatcher`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The request could not be stored; nothing was appended
    #[error("Request store unavailable: {0}")]
    StoreUnavailable(String),

    /// Every generated id collided with an existing request
    #[error("Request id already in use: {0}")]
    AlreadyExists(RequestId),

    /// The request is stored but only some streams received the envelope
    #[error("Partial fan-out for {request_id}: {} of {} streams failed", failed.len(), succeeded.len() + failed.len())]
    PartialFanout {
        /// The stored request
        request_id: RequestId,
        /// Streams that received the envelope
        succeeded: Vec<StreamName>,
        /// Streams that did not
        failed: Vec<StreamName>,
    },

    /// No target streams were given
    #[error("No target streams")]
    NoTargetStreams,

    /// Re-fan-out of a request that is not (or no longer) stored
    #[error("Unknown request: {0}")]
    UnknownRequest(RequestId),
}

/// Envelope appended to one stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppendedEntry {
    /// Target stream
    pub stream: StreamName,
    /// Id assigned by the log
    pub entry_id: EntryId,
}

/// Successful dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchReceipt {
    /// Stored request
    pub request_id: RequestId,
    /// Streams the request was fanned out to, in the order given
    pub streams: Vec<StreamName>,
    /// Entry assigned on each stream
    pub entries: Vec<AppendedEntry>,
}

/// Dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Address workers report completions to
    pub callback_address: String,
    /// Lifetime of stored requests
    pub request_ttl: Duration,
    /// Ids tried before giving up on collisions
    pub max_id_attempts: u32,
}

impl DispatcherConfig {
    /// Settings with the given callback address and defaults otherwise
    /// (24 hour TTL, 3 id attempts).
    #[must_use]
    pub fn new(callback_address: impl Into<String>) -> Self {
        Self {
            callback_address: callback_address.into(),
            request_ttl: Duration::from_secs(24 * 60 * 60),
            max_id_attempts: 3,
        }
    }

    /// Set the request TTL.
    #[must_use]
    pub const fn with_request_ttl(mut self, ttl: Duration) -> Self {
        self.request_ttl = ttl;
        self
    }

    /// Set the number of id attempts (at least 1).
    #[must_use]
    pub const fn with_max_id_attempts(mut self, attempts: u32) -> Self {
        self.max_id_attempts = if attempts == 0 { 1 } else { attempts };
        self
    }
}

/// Stores requests and fans them out to streams.
///
/// Cheap to clone; safe to call from many tasks.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn RequestStore>,
    log: Arc<dyn StreamLog>,
    clock: Arc<dyn Clock>,
    config: DispatcherConfig,
}

impl Dispatcher {
    /// Create a dispatcher on the system clock.
    #[must_use]
    pub fn new(
        store: Arc<dyn RequestStore>,
        log: Arc<dyn StreamLog>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            log,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    /// Use `clock` for request creation and expiry times.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Dispatcher settings.
    #[must_use]
    pub const fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Store a new request and append its envelope to every target stream.
    ///
    /// Duplicate stream names are collapsed. Returns as soon as the appends
    /// are done; it does not wait for workers.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::NoTargetStreams`] if `target_streams` is empty
    /// - [`DispatchError::StoreUnavailable`] if the request could not be stored
    ///   (nothing was appended)
    /// - [`DispatchError::AlreadyExists`] if every id attempt collided
    /// - [`DispatchError::PartialFanout`] if some appends failed
    pub async fn dispatch(
        &self,
        payload: RequestPayload,
        target_streams: &[StreamName],
    ) -> Result<DispatchReceipt, DispatchError> {
        let started = Instant::now();
        let result = self.dispatch_inner(payload, target_streams).await;
        DispatchMetrics::record_outcome(outcome_label(&result), started.elapsed());
        result
    }

    /// Append envelopes for an already stored request again, e.g. to the
    /// streams a [`DispatchError::PartialFanout`] reported as failed.
    ///
    /// Re-appending is safe: consumers tell messages apart by entry id.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::NoTargetStreams`] if `streams` is empty
    /// - [`DispatchError::UnknownRequest`] if the request is gone
    /// - [`DispatchError::StoreUnavailable`] if the lookup failed
    /// - [`DispatchError::PartialFanout`] if some appends failed
    pub async fn refanout(
        &self,
        request_id: RequestId,
        streams: &[StreamName],
    ) -> Result<DispatchReceipt, DispatchError> {
        let streams = dedup_streams(streams);
        if streams.is_empty() {
            return Err(DispatchError::NoTargetStreams);
        }
        match self.store.get(request_id).await {
            Ok(_) => {}
            Err(RequestStoreError::NotFound(_)) => {
                return Err(DispatchError::UnknownRequest(request_id));
            }
            Err(e) => return Err(DispatchError::StoreUnavailable(e.to_string())),
        }
        tracing::info!(%request_id, streams = ?streams, "Re-fanning out request");
        self.fan_out(request_id, streams).await
    }

    async fn dispatch_inner(
        &self,
        payload: RequestPayload,
        target_streams: &[StreamName],
    ) -> Result<DispatchReceipt, DispatchError> {
        let streams = dedup_streams(target_streams);
        if streams.is_empty() {
            return Err(DispatchError::NoTargetStreams);
        }

        let request_id = self.store_request(payload, &streams).await?;
        self.fan_out(request_id, streams).await
    }

    async fn store_request(
        &self,
        payload: RequestPayload,
        streams: &[StreamName],
    ) -> Result<RequestId, DispatchError> {
        let ttl = chrono::Duration::from_std(self.config.request_ttl)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let expected = u32::try_from(streams.len()).unwrap_or(u32::MAX);

        let mut last_id = None;
        for attempt in 1..=self.config.max_id_attempts {
            let request = WorkRequest::new(
                RequestId::generate(),
                payload.clone(),
                self.clock.now(),
                ttl,
                expected,
            );
            let request_id = request.id;
            match self.store.put(request).await {
                Ok(()) => {
                    tracing::debug!(%request_id, slug = %payload.slug(), "Stored request");
                    return Ok(request_id);
                }
                Err(RequestStoreError::AlreadyExists(_)) => {
                    tracing::warn!(%request_id, attempt, "Request id collision, regenerating");
                    last_id = Some(request_id);
                }
                Err(e) => {
                    tracing::error!(error = %e, slug = %payload.slug(), "Failed to store request");
                    return Err(DispatchError::StoreUnavailable(e.to_string()));
                }
            }
        }
        Err(DispatchError::AlreadyExists(
            last_id.unwrap_or_else(RequestId::generate),
        ))
    }

    async fn fan_out(
        &self,
        request_id: RequestId,
        streams: Vec<StreamName>,
    ) -> Result<DispatchReceipt, DispatchError> {
        let message = StreamMessage::new(request_id, self.config.callback_address.clone());
        let mut entries = Vec::with_capacity(streams.len());
        let mut failed = Vec::new();

        for stream in &streams {
            match self.log.append(stream, message.clone()).await {
                Ok(entry_id) => {
                    tracing::debug!(%request_id, %stream, %entry_id, "Appended envelope");
                    DispatchMetrics::record_append(stream);
                    entries.push(AppendedEntry {
                        stream: stream.clone(),
                        entry_id,
                    });
                }
                Err(e) => {
                    tracing::error!(%request_id, %stream, error = %e, "Append failed");
                    failed.push(stream.clone());
                }
            }
        }

        if !failed.is_empty() {
            return Err(DispatchError::PartialFanout {
                request_id,
                succeeded: entries.into_iter().map(|e| e.stream).collect(),
                failed,
            });
        }

        tracing::info!(%request_id, streams = streams.len(), "Request dispatched");
        Ok(DispatchReceipt {
            request_id,
            streams,
            entries,
        })
    }
}

fn dedup_streams(streams: &[StreamName]) -> Vec<StreamName> {
    let mut seen = HashSet::new();
    streams
        .iter()
        .filter(|s| seen.insert((*s).clone()))
        .cloned()
        .collect()
}

const fn outcome_label(result: &Result<DispatchReceipt, DispatchError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(DispatchError::PartialFanout { .. }) => "partial_fanout",
        Err(DispatchError::StoreUnavailable(_)) => "store_unavailable",
        Err(_) => "rejected",
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use prscan_core::{ConsumerName, GroupName};
    use prscan_testing::helpers::{sample_payload, streams};
    use prscan_testing::{InMemoryRequestStore, InMemoryStreamLog, ManualClock};

    fn setup() -> (Dispatcher, InMemoryRequestStore, InMemoryStreamLog) {
        let store = InMemoryRequestStore::new();
        let log = InMemoryStreamLog::new();
        let dispatcher = Dispatcher::new(
            Arc::new(store.clone()),
            Arc::new(log.clone()),
            DispatcherConfig::new("http://coordinator:8000/callbacks"),
        );
        (dispatcher, store, log)
    }

    #[tokio::test]
    async fn dispatch_stores_then_appends_to_every_stream() {
        let (dispatcher, store, log) = setup();
        let targets = streams(&["worker-kics", "worker-blackduck"]);

        let receipt = dispatcher.dispatch(sample_payload(), &targets).await.unwrap();
        assert_eq!(receipt.streams, targets);

        let stored = store.get(receipt.request_id).await.unwrap();
        assert_eq!(stored.payload, sample_payload());
        assert_eq!(stored.expected_completions, 2);
        assert_eq!(stored.expires_at - stored.created_at, chrono::Duration::hours(24));

        for stream in &targets {
            let entries = log.entries(stream);
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].1.request_id, receipt.request_id);
            assert_eq!(entries[0].1.callback_address, "http://coordinator:8000/callbacks");
        }
    }

    #[tokio::test]
    async fn store_failure_appends_nothing() {
        let (dispatcher, store, log) = setup();
        store.set_unavailable(true);
        let targets = streams(&["a", "b"]);

        let err = dispatcher.dispatch(sample_payload(), &targets).await.unwrap_err();
        assert!(matches!(err, DispatchError::StoreUnavailable(_)));
        assert!(log.is_empty(&targets[0]));
        assert!(log.is_empty(&targets[1]));
    }

    #[tokio::test]
    async fn partial_fanout_names_both_sides_and_refanout_repairs_it() {
        let (dispatcher, store, log) = setup();
        let targets = streams(&["a", "b", "c"]);
        log.fail_appends_to(&targets[1]);

        let err = dispatcher.dispatch(sample_payload(), &targets).await.unwrap_err();
        let DispatchError::PartialFanout {
            request_id,
            succeeded,
            failed,
        } = err
        else {
            panic!("expected PartialFanout, got {err:?}");
        };
        assert_eq!(succeeded, streams(&["a", "c"]));
        assert_eq!(failed, streams(&["b"]));
        assert!(store.get(request_id).await.is_ok());

        log.heal_appends();
        let receipt = dispatcher.refanout(request_id, &failed).await.unwrap();
        assert_eq!(receipt.request_id, request_id);
        assert_eq!(log.len(&targets[1]), 1);
        assert_eq!(log.len(&targets[0]), 1);
    }

    #[tokio::test]
    async fn empty_and_duplicate_targets() {
        let (dispatcher, store, log) = setup();
        assert_eq!(
            dispatcher.dispatch(sample_payload(), &[]).await.unwrap_err(),
            DispatchError::NoTargetStreams
        );
        assert!(store.is_empty());

        let receipt = dispatcher
            .dispatch(sample_payload(), &streams(&["a", "a", "b"]))
            .await
            .unwrap();
        assert_eq!(receipt.streams, streams(&["a", "b"]));
        assert_eq!(log.len(&StreamName::new("a")), 1);
        assert_eq!(store.get(receipt.request_id).await.unwrap().expected_completions, 2);
    }

    #[tokio::test]
    async fn refanout_of_expired_request_is_unknown() {
        let clock = ManualClock::default();
        let store = InMemoryRequestStore::with_clock(Arc::new(clock.clone()));
        let log = InMemoryStreamLog::new();
        let dispatcher = Dispatcher::new(
            Arc::new(store),
            Arc::new(log),
            DispatcherConfig::new("http://cb").with_request_ttl(Duration::from_secs(60)),
        )
        .with_clock(Arc::new(clock.clone()));

        let receipt = dispatcher.dispatch(sample_payload(), &streams(&["a"])).await.unwrap();
        clock.advance(Duration::from_secs(60));
        assert_eq!(
            dispatcher.refanout(receipt.request_id, &streams(&["a"])).await.unwrap_err(),
            DispatchError::UnknownRequest(receipt.request_id)
        );
    }

    #[tokio::test]
    async fn dispatched_message_is_readable_by_a_worker() {
        let (dispatcher, _store, log) = setup();
        let receipt = dispatcher.dispatch(sample_payload(), &streams(&["a"])).await.unwrap();
        let batch = log
            .read_group(
                &StreamName::new("a"),
                &GroupName::workers(),
                &ConsumerName::new("w1"),
                1,
                Duration::ZERO,
            )
            .await
            .unwrap();
        assert_eq!(batch[0].message.request_id, receipt.request_id);
        assert_eq!(batch[0].entry_id, receipt.entries[0].entry_id);
    }
}
