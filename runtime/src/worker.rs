//! Worker loop.
//!
//! One [`WorkerLoop`] is one consumer of one stream within one consumer group.
//! Every iteration walks the same phases:
//!
//! ```text
//! Idle ─► Reclaiming ─► Reading ─► Processing ─► Acking ─► Idle
//!              │                       │
//!              └── stale pending ──────┘  (reclaimed work first)
//! ```
//!
//! - Handler errors and panics leave the message pending; it comes back
//!   through reclaim once idle for `reclaim_min_idle`.
//! - A message that fails its `max_deliveries`-th delivery is contained
//!   according to the [`PoisonPolicy`].
//! - Stream log errors never end the loop: it backs off and retries.
//! - Stopping finishes the message in hand and starts no new read. Anything
//!   already claimed but unfinished is recovered by another consumer's reclaim.

use crate::metrics::WorkerMetrics;
use crate::retry::{Backoff, RetryPolicy};
use futures::FutureExt;
use prscan_core::environment::{Clock, SystemClock};
use prscan_core::{
    Burial, ConsumerName, DeadLetterSink, Delivery, EntryId, FailureRecord, GroupName, StreamLog,
    StreamLogError, StreamName,
};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;

/// Error returned by a [`MessageHandler`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The handler failed; the message stays pending for a later attempt
    #[error("Handler failed: {0}")]
    Failed(String),

    /// The handler panicked
    #[error("Handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    /// Convenience constructor for [`HandlerError::Failed`].
    pub fn failed(message: impl fmt::Display) -> Self {
        Self::Failed(message.to_string())
    }
}

/// Processes one delivery.
///
/// Returning `Ok` acknowledges and deletes the message. Returning an error (or
/// panicking) leaves it pending.
pub trait MessageHandler: Send + Sync {
    /// Handle a delivery.
    ///
    /// # Errors
    ///
    /// Any error leaves the message pending for redelivery.
    fn handle<'a>(
        &'a self,
        delivery: &'a Delivery,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>>;
}

/// What to do with a message whose handler keeps failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoisonPolicy {
    /// Bury it in the dead-letter sink, then ack and delete it
    #[default]
    DeadLetter,
    /// Ack and delete it, keeping only the log line
    Drop,
    /// Never give up
    KeepRetrying,
}

impl PoisonPolicy {
    /// Configuration name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::DeadLetter => "dead-letter",
            Self::Drop => "drop",
            Self::KeepRetrying => "keep-retrying",
        }
    }
}

impl FromStr for PoisonPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "dead-letter" | "deadletter" => Ok(Self::DeadLetter),
            "drop" => Ok(Self::Drop),
            "keep-retrying" | "retry" => Ok(Self::KeepRetrying),
            other => Err(format!("unknown poison policy: {other}")),
        }
    }
}

/// Polling and redelivery settings.
///
/// # Default Values
///
/// - `block_timeout`: 5 seconds
/// - `batch_size`: 1
/// - `reclaim_min_idle`: 60 seconds
/// - `reclaim_batch`: 10
/// - `max_deliveries`: 5
/// - `poison_policy`: dead-letter
/// - `backoff`: 100ms doubling to 30 seconds, jittered
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Longest a read waits for new messages
    pub block_timeout: Duration,
    /// Messages per read
    pub batch_size: usize,
    /// Idle time after which another consumer's pending message is taken over.
    /// Must exceed the longest expected scan, or slow scans get duplicated.
    pub reclaim_min_idle: Duration,
    /// Messages per reclaim
    pub reclaim_batch: usize,
    /// Failed deliveries before the poison policy applies
    pub max_deliveries: u32,
    /// What to do with poison messages
    pub poison_policy: PoisonPolicy,
    /// Delays after stream log errors
    pub backoff: RetryPolicy,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl PollConfig {
    /// Create a new config builder.
    #[must_use]
    pub fn builder() -> PollConfigBuilder {
        PollConfigBuilder {
            config: Self {
                block_timeout: Duration::from_secs(5),
                batch_size: 1,
                reclaim_min_idle: Duration::from_secs(60),
                reclaim_batch: 10,
                max_deliveries: 5,
                poison_policy: PoisonPolicy::DeadLetter,
                backoff: RetryPolicy::default(),
            },
        }
    }
}

/// Builder for [`PollConfig`].
#[derive(Debug, Clone)]
pub struct PollConfigBuilder {
    config: PollConfig,
}

impl PollConfigBuilder {
    /// Set the read block timeout.
    #[must_use]
    pub const fn block_timeout(mut self, timeout: Duration) -> Self {
        self.config.block_timeout = timeout;
        self
    }

    /// Set messages per read (at least 1).
    #[must_use]
    pub const fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = if size == 0 { 1 } else { size };
        self
    }

    /// Set the reclaim idle threshold.
    #[must_use]
    pub const fn reclaim_min_idle(mut self, idle: Duration) -> Self {
        self.config.reclaim_min_idle = idle;
        self
    }

    /// Set messages per reclaim (at least 1).
    #[must_use]
    pub const fn reclaim_batch(mut self, size: usize) -> Self {
        self.config.reclaim_batch = if size == 0 { 1 } else { size };
        self
    }

    /// Set the delivery threshold (at least 1).
    #[must_use]
    pub const fn max_deliveries(mut self, max: u32) -> Self {
        self.config.max_deliveries = if max == 0 { 1 } else { max };
        self
    }

    /// Set the poison policy.
    #[must_use]
    pub const fn poison_policy(mut self, policy: PoisonPolicy) -> Self {
        self.config.poison_policy = policy;
        self
    }

    /// Set the storage error backoff.
    #[must_use]
    pub fn backoff(mut self, policy: RetryPolicy) -> Self {
        self.config.backoff = policy;
        self
    }

    /// Build the [`PollConfig`].
    #[must_use]
    pub fn build(self) -> PollConfig {
        self.config
    }
}

/// Where a worker loop consumes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Stream to consume
    pub stream: StreamName,
    /// Consumer group
    pub group: GroupName,
    /// This consumer's name within the group
    pub consumer: ConsumerName,
}

impl Subscription {
    /// Create a subscription.
    #[must_use]
    pub fn new(
        stream: impl Into<StreamName>,
        group: impl Into<GroupName>,
        consumer: impl Into<ConsumerName>,
    ) -> Self {
        Self {
            stream: stream.into(),
            group: group.into(),
            consumer: consumer.into(),
        }
    }
}

/// Current phase of a worker loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    /// Between iterations, or backing off
    Idle,
    /// Taking over stale pending messages
    Reclaiming,
    /// Waiting for new messages
    Reading,
    /// Running the handler
    Processing,
    /// Acknowledging and deleting
    Acking,
    /// Stopped
    Stopped,
}

impl WorkerPhase {
    /// Lowercase name, as reported by `/status`.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Reclaiming => "reclaiming",
            Self::Reading => "reading",
            Self::Processing => "processing",
            Self::Acking => "acking",
            Self::Stopped => "stopped",
        }
    }
}

/// Counts for one iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IterationReport {
    /// Messages taken over by reclaim
    pub reclaimed: usize,
    /// New messages read
    pub read: usize,
    /// Messages handled successfully (acked and deleted)
    pub acked: usize,
    /// Failed handler attempts (left pending unless contained)
    pub failed: usize,
    /// Poison messages buried
    pub dead_lettered: usize,
    /// Poison messages dropped
    pub dropped: usize,
}

impl IterationReport {
    /// Whether the iteration touched no message.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.reclaimed == 0 && self.read == 0
    }
}

/// Long-running consumer of one stream.
pub struct WorkerLoop {
    log: Arc<dyn StreamLog>,
    handler: Arc<dyn MessageHandler>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    clock: Arc<dyn Clock>,
    subscription: Subscription,
    config: PollConfig,
    phase: watch::Sender<WorkerPhase>,
}

impl WorkerLoop {
    /// Create a loop without a dead-letter sink.
    ///
    /// With [`PoisonPolicy::DeadLetter`] and no sink, poison messages are
    /// dropped (and logged at error level).
    #[must_use]
    pub fn new(
        log: Arc<dyn StreamLog>,
        subscription: Subscription,
        handler: Arc<dyn MessageHandler>,
        config: PollConfig,
    ) -> Self {
        let (phase, _) = watch::channel(WorkerPhase::Idle);
        Self {
            log,
            handler,
            dead_letters: None,
            clock: Arc::new(SystemClock),
            subscription,
            config,
            phase,
        }
    }

    /// Journal failures in, and bury poison messages into, `sink`.
    #[must_use]
    pub fn with_dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    /// Use `clock` for failure and burial timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// What this loop consumes.
    #[must_use]
    pub const fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> WorkerPhase {
        *self.phase.borrow()
    }

    /// Watch phase changes.
    #[must_use]
    pub fn watch_phase(&self) -> watch::Receiver<WorkerPhase> {
        self.phase.subscribe()
    }

    /// Run until `shutdown` becomes `true` (or its sender is dropped).
    ///
    /// Stream log errors are logged and retried with backoff.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let sub = &self.subscription;
        tracing::info!(
            stream = %sub.stream,
            group = %sub.group,
            consumer = %sub.consumer,
            "Worker loop started"
        );

        let mut backoff = Backoff::new(self.config.backoff.clone());
        loop {
            if stop_requested(&shutdown) {
                break;
            }
            match self.iterate(Some(&mut shutdown)).await {
                Ok(report) => {
                    if backoff.failures() > 0 {
                        tracing::info!(stream = %sub.stream, "Stream log recovered");
                    }
                    backoff.reset();
                    if !report.is_empty() {
                        tracing::debug!(stream = %sub.stream, ?report, "Iteration complete");
                    }
                }
                Err(e) => {
                    self.set_phase(WorkerPhase::Idle);
                    WorkerMetrics::record_storage_error(&sub.stream);
                    let delay = backoff.next_delay();
                    tracing::error!(
                        stream = %sub.stream,
                        consumer = %sub.consumer,
                        error = %e,
                        failures = backoff.failures(),
                        delay_ms = delay.as_millis(),
                        "Stream log error, backing off"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        _ = shutdown.wait_for(|stop| *stop) => {}
                    }
                }
            }
        }

        self.set_phase(WorkerPhase::Stopped);
        tracing::info!(stream = %sub.stream, consumer = %sub.consumer, "Worker loop stopped");
    }

    /// Run a single iteration: reclaim, then read, processing everything
    /// obtained.
    ///
    /// # Errors
    ///
    /// Returns the first stream log error. Messages processed before it stay
    /// processed; the rest stay pending.
    pub async fn run_once(&self) -> Result<IterationReport, StreamLogError> {
        self.iterate(None).await
    }

    async fn iterate(
        &self,
        shutdown: Option<&mut watch::Receiver<bool>>,
    ) -> Result<IterationReport, StreamLogError> {
        let sub = &self.subscription;
        let mut report = IterationReport::default();

        self.set_phase(WorkerPhase::Reclaiming);
        let reclaimed = self
            .log
            .reclaim(
                &sub.stream,
                &sub.group,
                &sub.consumer,
                self.config.reclaim_min_idle,
                self.config.reclaim_batch,
            )
            .await?;
        if !reclaimed.is_empty() {
            report.reclaimed = reclaimed.len();
            WorkerMetrics::record_reclaimed(&sub.stream, reclaimed.len());
            tracing::info!(
                stream = %sub.stream,
                consumer = %sub.consumer,
                count = reclaimed.len(),
                "Reclaimed stale messages"
            );
        }
        for delivery in reclaimed {
            self.process(delivery, &mut report).await?;
        }

        if shutdown.as_ref().is_some_and(|s| stop_requested(s)) {
            self.set_phase(WorkerPhase::Idle);
            return Ok(report);
        }

        // Reclaimed work already used this iteration; don't also block.
        let block = if report.reclaimed > 0 {
            Duration::ZERO
        } else {
            self.config.block_timeout
        };

        self.set_phase(WorkerPhase::Reading);
        let read = self.log.read_group(
            &sub.stream,
            &sub.group,
            &sub.consumer,
            self.config.batch_size,
            block,
        );
        let batch = match shutdown {
            Some(shutdown) => tokio::select! {
                batch = read => batch?,
                _ = shutdown.wait_for(|stop| *stop) => Vec::new(),
            },
            None => read.await?,
        };

        report.read = batch.len();
        for delivery in batch {
            self.process(delivery, &mut report).await?;
        }

        self.set_phase(WorkerPhase::Idle);
        Ok(report)
    }

    async fn process(
        &self,
        delivery: Delivery,
        report: &mut IterationReport,
    ) -> Result<(), StreamLogError> {
        let sub = &self.subscription;
        let max = self.config.max_deliveries;

        if delivery.delivery_count > max && self.config.poison_policy != PoisonPolicy::KeepRetrying {
            tracing::warn!(
                stream = %sub.stream,
                entry_id = %delivery.entry_id,
                request_id = %delivery.message.request_id,
                delivery_count = delivery.delivery_count,
                "Reclaimed message is past max deliveries, containing without handling"
            );
            return self.contain(&delivery, report).await;
        }

        self.set_phase(WorkerPhase::Processing);
        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.handler.handle(&delivery))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(HandlerError::Panicked(panic_message(&*panic))));
        WorkerMetrics::record_handler(&sub.stream, started.elapsed());

        match outcome {
            Ok(()) => {
                self.set_phase(WorkerPhase::Acking);
                self.ack_and_delete(&delivery).await?;
                report.acked += 1;
                WorkerMetrics::record_delivery(&sub.stream, "acked");
                tracing::info!(
                    stream = %sub.stream,
                    entry_id = %delivery.entry_id,
                    request_id = %delivery.message.request_id,
                    delivery_count = delivery.delivery_count,
                    "Message processed"
                );
                if delivery.delivery_count > 1 {
                    self.clear_journal(delivery.entry_id).await;
                }
                Ok(())
            }
            Err(error) => {
                report.failed += 1;
                WorkerMetrics::record_delivery(&sub.stream, "failed");
                tracing::warn!(
                    stream = %sub.stream,
                    consumer = %sub.consumer,
                    entry_id = %delivery.entry_id,
                    request_id = %delivery.message.request_id,
                    delivery_count = delivery.delivery_count,
                    max_deliveries = max,
                    error = %error,
                    "Handler failed, leaving message pending"
                );
                self.journal_failure(&delivery, &error).await;

                if delivery.delivery_count >= max
                    && self.config.poison_policy != PoisonPolicy::KeepRetrying
                {
                    return self.contain(&delivery, report).await;
                }
                Ok(())
            }
        }
    }

    async fn journal_failure(&self, delivery: &Delivery, error: &HandlerError) {
        let Some(sink) = &self.dead_letters else {
            return;
        };
        let failure = FailureRecord {
            attempt: delivery.delivery_count,
            consumer: self.subscription.consumer.clone(),
            error: error.to_string(),
            failed_at: self.clock.now(),
        };
        if let Err(e) = sink
            .record_failure(&self.subscription.stream, delivery.entry_id, failure)
            .await
        {
            tracing::warn!(error = %e, entry_id = %delivery.entry_id, "Failed to journal handler failure");
        }
    }

    async fn clear_journal(&self, entry_id: EntryId) {
        let Some(sink) = &self.dead_letters else {
            return;
        };
        if let Err(e) = sink.clear_failures(&self.subscription.stream, entry_id).await {
            tracing::warn!(error = %e, entry_id = %entry_id, "Failed to clear failure journal");
        }
    }

    /// Apply the poison policy to a message that will not be handled again.
    async fn contain(
        &self,
        delivery: &Delivery,
        report: &mut IterationReport,
    ) -> Result<(), StreamLogError> {
        let sub = &self.subscription;
        let sink = match (self.config.poison_policy, &self.dead_letters) {
            (PoisonPolicy::KeepRetrying, _) => return Ok(()),
            (PoisonPolicy::DeadLetter, Some(sink)) => Some(sink),
            (PoisonPolicy::DeadLetter, None) => {
                tracing::error!(
                    stream = %sub.stream,
                    entry_id = %delivery.entry_id,
                    "No dead-letter sink configured, dropping poison message"
                );
                None
            }
            (PoisonPolicy::Drop, _) => None,
        };

        if let Some(sink) = sink {
            let burial = Burial {
                stream: sub.stream.clone(),
                entry_id: delivery.entry_id,
                group: sub.group.clone(),
                message: delivery.message.clone(),
                delivery_count: delivery.delivery_count,
                dead_lettered_at: self.clock.now(),
            };
            match sink.bury(burial).await {
                Ok(letter) => {
                    self.set_phase(WorkerPhase::Acking);
                    self.ack_and_delete(delivery).await?;
                    report.dead_lettered += 1;
                    WorkerMetrics::record_delivery(&sub.stream, "dead_lettered");
                    tracing::error!(
                        stream = %sub.stream,
                        group = %sub.group,
                        entry_id = %delivery.entry_id,
                        request_id = %delivery.message.request_id,
                        delivery_count = delivery.delivery_count,
                        failures = letter.failures.len(),
                        "Poison message moved to dead letters"
                    );
                }
                Err(e) => {
                    // Stays pending; the next reclaim tries to bury it again.
                    tracing::error!(
                        stream = %sub.stream,
                        entry_id = %delivery.entry_id,
                        error = %e,
                        "Failed to bury poison message, leaving it pending"
                    );
                }
            }
            return Ok(());
        }

        self.set_phase(WorkerPhase::Acking);
        self.ack_and_delete(delivery).await?;
        // A dropped message leaves no dead letter to hold its journal.
        self.clear_journal(delivery.entry_id).await;
        report.dropped += 1;
        WorkerMetrics::record_delivery(&sub.stream, "dropped");
        tracing::error!(
            stream = %sub.stream,
            entry_id = %delivery.entry_id,
            request_id = %delivery.message.request_id,
            delivery_count = delivery.delivery_count,
            "Poison message dropped"
        );
        Ok(())
    }

    async fn ack_and_delete(&self, delivery: &Delivery) -> Result<(), StreamLogError> {
        let sub = &self.subscription;
        self.log.ack(&sub.stream, &sub.group, delivery.entry_id).await?;
        self.log.delete(&sub.stream, delivery.entry_id).await
    }

    fn set_phase(&self, phase: WorkerPhase) {
        self.phase.send_replace(phase);
    }
}

fn stop_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use prscan_core::{DeadLetterStatus, RequestId, StreamMessage};
    use prscan_testing::{InMemoryDeadLetterSink, InMemoryStreamLog, ManualClock};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Handler that fails its first `failures` calls, then succeeds.
    struct Flaky {
        failures: usize,
        calls: AtomicUsize,
        seen: Mutex<Vec<u32>>,
    }

    impl Flaky {
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    impl MessageHandler for Flaky {
        fn handle<'a>(
            &'a self,
            delivery: &'a Delivery,
        ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>> {
            Box::pin(async move {
                self.seen.lock().unwrap().push(delivery.delivery_count);
                let call = self.calls.fetch_add(1, Ordering::SeqCst);
                if call < self.failures {
                    Err(HandlerError::failed(format!("scan crashed on call {call}")))
                } else {
                    Ok(())
                }
            })
        }
    }

    struct Panicky;

    impl MessageHandler for Panicky {
        fn handle<'a>(
            &'a self,
            _delivery: &'a Delivery,
        ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>> {
            Box::pin(async { panic!("scanner exploded") })
        }
    }

    struct Harness {
        log: InMemoryStreamLog,
        sink: InMemoryDeadLetterSink,
        clock: ManualClock,
        stream: StreamName,
    }

    impl Harness {
        fn new() -> Self {
            let clock = ManualClock::default();
            Self {
                log: InMemoryStreamLog::with_clock(Arc::new(clock.clone())),
                sink: InMemoryDeadLetterSink::with_clock(Arc::new(clock.clone())),
                clock,
                stream: StreamName::new("worker-kics"),
            }
        }

        fn worker(&self, handler: Arc<dyn MessageHandler>, config: PollConfig) -> WorkerLoop {
            WorkerLoop::new(
                Arc::new(self.log.clone()),
                Subscription::new(self.stream.clone(), GroupName::workers(), "w1"),
                handler,
                config,
            )
            .with_dead_letter_sink(Arc::new(self.sink.clone()))
            .with_clock(Arc::new(self.clock.clone()))
        }

        async fn append(&self) -> EntryId {
            self.log
                .append(&self.stream, StreamMessage::new(RequestId::generate(), "http://cb"))
                .await
                .unwrap()
        }
    }

    fn config(max_deliveries: u32) -> PollConfig {
        PollConfig::builder()
            .block_timeout(Duration::ZERO)
            .reclaim_min_idle(Duration::from_secs(60))
            .max_deliveries(max_deliveries)
            .build()
    }

    #[tokio::test]
    async fn success_acks_and_deletes() {
        let h = Harness::new();
        h.append().await;
        let worker = h.worker(Flaky::new(0), config(5));

        let report = worker.run_once().await.unwrap();
        assert_eq!(report.read, 1);
        assert_eq!(report.acked, 1);
        assert!(h.log.is_empty(&h.stream));
        assert!(h.log.pending(&h.stream, &GroupName::workers()).await.unwrap().is_empty());
        assert_eq!(worker.phase(), WorkerPhase::Idle);
    }

    #[tokio::test]
    async fn failure_leaves_pending_until_reclaim() {
        let h = Harness::new();
        let entry_id = h.append().await;
        let handler = Flaky::new(1);
        let worker = h.worker(handler.clone(), config(5));

        let first = worker.run_once().await.unwrap();
        assert_eq!(first.failed, 1);
        let pending = h.log.pending(&h.stream, &GroupName::workers()).await.unwrap();
        assert_eq!(pending[0].entry_id, entry_id);

        // Not idle long enough yet: nothing to do.
        assert!(worker.run_once().await.unwrap().is_empty());

        h.clock.advance(Duration::from_secs(60));
        let retry = worker.run_once().await.unwrap();
        assert_eq!(retry.reclaimed, 1);
        assert_eq!(retry.acked, 1);
        assert_eq!(*handler.seen.lock().unwrap(), vec![1, 2]);
        assert!(h.log.is_empty(&h.stream));
        assert!(h.sink.journalled(&h.stream, entry_id).is_empty());
    }

    #[tokio::test]
    async fn always_failing_message_is_buried_after_max_deliveries() {
        let h = Harness::new();
        let entry_id = h.append().await;
        let handler = Flaky::new(usize::MAX);
        let worker = h.worker(handler.clone(), config(3));

        let mut dead = 0;
        for _ in 0..6 {
            dead += worker.run_once().await.unwrap().dead_lettered;
            h.clock.advance(Duration::from_secs(61));
        }

        assert_eq!(dead, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert!(h.log.is_empty(&h.stream));
        assert!(h.log.pending(&h.stream, &GroupName::workers()).await.unwrap().is_empty());

        let letter = h.sink.get(&h.stream, entry_id).await.unwrap();
        assert_eq!(letter.status, DeadLetterStatus::Pending);
        assert_eq!(letter.delivery_count, 3);
        assert_eq!(
            letter.failures.iter().map(|f| f.attempt).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(letter.failures[0].error.contains("scan crashed"));
    }

    #[tokio::test]
    async fn panics_are_failures() {
        let h = Harness::new();
        let entry_id = h.append().await;
        let worker = h.worker(Arc::new(Panicky), config(5));

        let report = worker.run_once().await.unwrap();
        assert_eq!(report.failed, 1);
        let journal = h.sink.journalled(&h.stream, entry_id);
        assert!(journal[0].error.contains("scanner exploded"));
        assert_eq!(h.log.pending(&h.stream, &GroupName::workers()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reclaimed_message_past_threshold_is_contained_without_handling() {
        let h = Harness::new();
        h.append().await;

        // Another consumer burns through the deliveries without finishing.
        let group = GroupName::workers();
        h.log
            .read_group(&h.stream, &group, &ConsumerName::new("crashy"), 1, Duration::ZERO)
            .await
            .unwrap();
        for _ in 0..2 {
            h.clock.advance(Duration::from_secs(61));
            h.log
                .reclaim(&h.stream, &group, &ConsumerName::new("crashy"), Duration::from_secs(60), 1)
                .await
                .unwrap();
        }

        h.clock.advance(Duration::from_secs(61));
        let handler = Flaky::new(0);
        let worker = h.worker(handler.clone(), config(2));
        let report = worker.run_once().await.unwrap();

        assert_eq!(report.dead_lettered, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        assert!(h.log.is_empty(&h.stream));
    }

    #[tokio::test]
    async fn drop_policy_discards_without_sink() {
        let h = Harness::new();
        h.append().await;
        let worker = WorkerLoop::new(
            Arc::new(h.log.clone()),
            Subscription::new(h.stream.clone(), GroupName::workers(), "w1"),
            Flaky::new(usize::MAX),
            PollConfig::builder()
                .block_timeout(Duration::ZERO)
                .max_deliveries(1)
                .poison_policy(PoisonPolicy::Drop)
                .build(),
        );

        let report = worker.run_once().await.unwrap();
        assert_eq!(report.dropped, 1);
        assert!(h.log.is_empty(&h.stream));
        assert!(h.sink.is_empty());
    }

    #[tokio::test]
    async fn dropped_messages_leave_no_failure_journal() {
        let h = Harness::new();
        let entry_id = h.append().await;
        let mut cfg = config(1);
        cfg.poison_policy = PoisonPolicy::Drop;
        let worker = h.worker(Flaky::new(usize::MAX), cfg);

        let report = worker.run_once().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.dropped, 1);
        assert!(h.log.is_empty(&h.stream));
        assert!(h.sink.journalled(&h.stream, entry_id).is_empty());
        assert!(h.sink.is_empty());
    }

    #[tokio::test]
    async fn keep_retrying_never_contains() {
        let h = Harness::new();
        h.append().await;
        let handler = Flaky::new(usize::MAX);
        let mut cfg = config(1);
        cfg.poison_policy = PoisonPolicy::KeepRetrying;
        let worker = h.worker(handler.clone(), cfg);

        for _ in 0..4 {
            worker.run_once().await.unwrap();
            h.clock.advance(Duration::from_secs(61));
        }
        assert_eq!(handler.calls.load(Ordering::SeqCst), 4);
        assert_eq!(h.log.len(&h.stream), 1);
        assert!(h.sink.is_empty());
    }

    #[tokio::test]
    async fn storage_errors_surface_from_run_once() {
        let h = Harness::new();
        let worker = h.worker(Flaky::new(0), config(5));
        h.log.set_unavailable(true);
        assert!(worker.run_once().await.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn run_stops_on_signal_and_survives_outages() {
        let h = Harness::new();
        h.log.set_unavailable(true);
        let worker = Arc::new(h.worker(
            Flaky::new(0),
            PollConfig::builder()
                .block_timeout(Duration::from_millis(20))
                .backoff(
                    RetryPolicy::builder()
                        .initial_delay(Duration::from_millis(5))
                        .max_delay(Duration::from_millis(20))
                        .build(),
                )
                .build(),
        ));

        let (stop, shutdown) = watch::channel(false);
        let running = tokio::spawn({
            let worker = Arc::clone(&worker);
            async move { worker.run(shutdown).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        h.log.set_unavailable(false);
        h.append().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.log.is_empty(&h.stream));

        stop.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(worker.phase(), WorkerPhase::Stopped);
    }

    #[test]
    fn poison_policy_names() {
        for policy in [PoisonPolicy::DeadLetter, PoisonPolicy::Drop, PoisonPolicy::KeepRetrying] {
            assert_eq!(policy.as_str().parse::<PoisonPolicy>().unwrap(), policy);
        }
        assert_eq!("DEAD_LETTER".parse::<PoisonPolicy>().unwrap(), PoisonPolicy::DeadLetter);
        assert!("explode".parse::<PoisonPolicy>().is_err());
    }
}
