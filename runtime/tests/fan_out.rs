//! End-to-end fan-out over the in-memory backends.
//!
//! Dispatcher → two streams → one worker loop per stream → scan → direct
//! callback → correlator.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use prscan_core::{
    CompletionOutcome, DeadLetterSink, GroupName, ScanResult, StreamLog, StreamName, WorkRequest,
    WorkerIdentity,
};
use prscan_runtime::{
    CallbackCorrelator, DirectNotifier, Dispatcher, DispatcherConfig, PollConfig, ScanError,
    ScanHandler, Scanner, Subscription, WorkerLoop, Workspace,
};
use prscan_testing::helpers::{payload_for, sample_payload, streams};
use prscan_testing::{
    InMemoryCompletionLedger, InMemoryDeadLetterSink, InMemoryRequestStore, InMemoryStreamLog,
};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch;

// ============================================================================
// Test Fixtures
// ============================================================================

/// Reports a fixed number of low findings and counts calls.
#[derive(Default)]
struct LowFindings {
    calls: AtomicUsize,
}

impl Scanner for LowFindings {
    fn scan<'a>(
        &'a self,
        request: &'a WorkRequest,
        workspace: &'a Workspace,
    ) -> Pin<Box<dyn Future<Output = Result<ScanResult, ScanError>> + Send + 'a>> {
        Box::pin(async move {
            assert!(workspace.path().is_dir());
            assert!(!request.payload.owner.is_empty());
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ScanResult {
                success: true,
                severity_counts: BTreeMap::from([("LOW".to_string(), 2)]),
                ..ScanResult::default()
            })
        })
    }
}

/// Never finishes a scan.
struct AlwaysTransient;

impl Scanner for AlwaysTransient {
    fn scan<'a>(
        &'a self,
        _request: &'a WorkRequest,
        _workspace: &'a Workspace,
    ) -> Pin<Box<dyn Future<Output = Result<ScanResult, ScanError>> + Send + 'a>> {
        Box::pin(async { Err(ScanError::Transient("registry unreachable".into())) })
    }
}

struct System {
    store: InMemoryRequestStore,
    log: InMemoryStreamLog,
    ledger: InMemoryCompletionLedger,
    sink: InMemoryDeadLetterSink,
    dispatcher: Dispatcher,
    correlator: Arc<CallbackCorrelator>,
}

impl System {
    fn new() -> Self {
        let store = InMemoryRequestStore::new();
        let log = InMemoryStreamLog::new();
        let ledger = InMemoryCompletionLedger::new();
        let dispatcher = Dispatcher::new(
            Arc::new(store.clone()),
            Arc::new(log.clone()),
            DispatcherConfig::new("http://coordinator:8000/callbacks"),
        );
        let correlator = Arc::new(CallbackCorrelator::new(
            Arc::new(store.clone()),
            Arc::new(ledger.clone()),
        ));
        Self {
            store,
            log,
            ledger,
            sink: InMemoryDeadLetterSink::new(),
            dispatcher,
            correlator,
        }
    }

    fn worker(
        &self,
        stream: &str,
        consumer: &str,
        scanner: Arc<dyn Scanner>,
        config: PollConfig,
    ) -> WorkerLoop {
        let identity = format!("{}-worker", stream.trim_start_matches("worker-"));
        let handler = ScanHandler::new(
            Arc::new(self.store.clone()),
            scanner,
            Arc::new(DirectNotifier::new(Arc::clone(&self.correlator))),
            identity,
        );
        WorkerLoop::new(
            Arc::new(self.log.clone()),
            Subscription::new(stream, GroupName::workers(), consumer),
            Arc::new(handler),
            config,
        )
        .with_dead_letter_sink(Arc::new(self.sink.clone()))
    }
}

fn quick() -> PollConfig {
    PollConfig::builder().block_timeout(Duration::ZERO).build()
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn two_streams_each_report_once() {
    let system = System::new();
    let scanner = Arc::new(LowFindings::default());
    let receipt = system
        .dispatcher
        .dispatch(sample_payload(), &streams(&["worker-kics", "worker-blackduck"]))
        .await
        .unwrap();

    for stream in ["worker-kics", "worker-blackduck"] {
        let worker = system.worker(stream, "w1", scanner.clone(), quick());
        let report = worker.run_once().await.unwrap();
        assert_eq!(report.acked, 1, "{stream}");
    }

    assert_eq!(scanner.calls.load(Ordering::SeqCst), 2);
    let records = system.correlator.completions(receipt.request_id).await.unwrap();
    let workers: Vec<_> = records.iter().map(|r| r.worker_identity.as_str()).collect();
    assert_eq!(workers, vec!["blackduck-worker", "kics-worker"]);
    assert!(records.iter().all(|r| r.result_summary == "2 issues (low 2)"));

    for stream in receipt.streams {
        assert!(system.log.is_empty(&stream));
        assert!(system.log.pending(&stream, &GroupName::workers()).await.unwrap().is_empty());
    }
}

#[tokio::test]
async fn redelivered_completion_is_duplicate() {
    let system = System::new();
    let receipt = system
        .dispatcher
        .dispatch(sample_payload(), &streams(&["worker-kics"]))
        .await
        .unwrap();
    system
        .worker("worker-kics", "w1", Arc::new(LowFindings::default()), quick())
        .run_once()
        .await
        .unwrap();

    let again = system
        .correlator
        .complete(
            receipt.request_id,
            WorkerIdentity::new("kics-worker"),
            ScanResult::failed("second attempt"),
        )
        .await
        .unwrap();
    assert_eq!(again, CompletionOutcome::Duplicate);
    assert_eq!(system.ledger.len(), 1);
}

#[tokio::test]
async fn poison_message_is_contained_and_others_flow() {
    let system = System::new();
    let poisoned = system
        .dispatcher
        .dispatch(payload_for("octocat", "broken", 1), &streams(&["worker-kics"]))
        .await
        .unwrap();

    let config = PollConfig::builder()
        .block_timeout(Duration::ZERO)
        .reclaim_min_idle(Duration::ZERO)
        .max_deliveries(3)
        .build();
    let failing = system.worker("worker-kics", "w1", Arc::new(AlwaysTransient), config);

    let mut dead = 0;
    for _ in 0..5 {
        dead += failing.run_once().await.unwrap().dead_lettered;
    }
    assert_eq!(dead, 1);

    let stream = StreamName::new("worker-kics");
    let letters = system.sink.list(None, 10).await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].message.request_id, poisoned.request_id);
    assert_eq!(letters[0].failures.len(), 3);
    assert!(letters[0].failures[2].error.contains("registry unreachable"));
    assert!(system.log.is_empty(&stream));

    // The stream keeps flowing after the poison message is gone.
    let healthy = system
        .dispatcher
        .dispatch(payload_for("octocat", "fine", 2), &streams(&["worker-kics"]))
        .await
        .unwrap();
    system
        .worker("worker-kics", "w2", Arc::new(LowFindings::default()), quick())
        .run_once()
        .await
        .unwrap();
    assert_eq!(system.correlator.completions(healthy.request_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn concurrent_workers_share_a_stream_and_stop_cleanly() {
    let system = System::new();
    let scanner = Arc::new(LowFindings::default());
    let mut ids = Vec::new();
    for pr in 0..10 {
        let receipt = system
            .dispatcher
            .dispatch(payload_for("octocat", "hello-world", pr), &streams(&["worker-kics"]))
            .await
            .unwrap();
        ids.push(receipt.request_id);
    }

    let (stop, shutdown) = watch::channel(false);
    let config = PollConfig::builder()
        .block_timeout(Duration::from_millis(20))
        .build();
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let worker = system.worker("worker-kics", &format!("w{i}"), scanner.clone(), config.clone());
            let shutdown = shutdown.clone();
            tokio::spawn(async move { worker.run(shutdown).await })
        })
        .collect();

    tokio::time::timeout(Duration::from_secs(5), async {
        while system.ledger.len() < 10 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("all requests completed");

    stop.send(true).unwrap();
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker stopped")
            .unwrap();
    }

    assert_eq!(scanner.calls.load(Ordering::SeqCst), 10);
    for id in ids {
        assert_eq!(system.correlator.completions(id).await.unwrap().len(), 1);
    }
}
