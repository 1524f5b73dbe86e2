//! Integration tests for the Redis backend with a real Redis instance.
//!
//! # Running These Tests
//!
//! These tests are marked as `#[ignore]` by default because they require
//! Docker (for testcontainers). To run explicitly:
//!
//! ```bash
//! cargo test -p prscan-redis --test redis_integration -- --ignored
//! ```

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use prscan_core::{
    CompletionLedger, CompletionNotice, CompletionRecord, ConsumerName, GroupName, RequestId,
    RequestStore, RequestStoreError, ScanResult, StreamLog, StreamLogError, StreamMessage,
    StreamName, WorkRequest, WorkerIdentity,
};
use prscan_redis::RedisBackend;
use prscan_testing::helpers::sample_payload;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::redis::{REDIS_PORT, Redis};

/// A plain connection for inspecting keys behind the backend's back.
async fn raw_connection(container: &ContainerAsync<Redis>) -> redis::aio::MultiplexedConnection {
    let port = container.get_host_port_ipv4(REDIS_PORT).await.unwrap();
    redis::Client::open(format!("redis://127.0.0.1:{port}"))
        .unwrap()
        .get_multiplexed_async_connection()
        .await
        .unwrap()
}

/// Start Redis 7 and connect.
///
/// Returns both the container (to keep it alive) and the backend.
async fn setup() -> (ContainerAsync<Redis>, RedisBackend) {
    let container = Redis::default()
        .with_tag("7.2-alpine")
        .start()
        .await
        .expect("Failed to start redis container");
    let port = container
        .get_host_port_ipv4(REDIS_PORT)
        .await
        .expect("Failed to get redis port");
    let backend = RedisBackend::connect(&format!("redis://127.0.0.1:{port}"))
        .await
        .expect("Failed to connect to redis");
    (container, backend)
}

fn request(ttl: chrono::Duration) -> WorkRequest {
    WorkRequest::new(RequestId::generate(), sample_payload(), chrono::Utc::now(), ttl, 2)
}

fn message() -> StreamMessage {
    StreamMessage::new(RequestId::generate(), "http://coordinator:8000/callbacks")
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn request_round_trip_and_conflict() {
    let (_container, backend) = setup().await;
    let store = backend.request_store();
    let stored = request(chrono::Duration::hours(1));

    store.put(stored.clone()).await.unwrap();
    assert_eq!(store.get(stored.id).await.unwrap(), stored);
    assert_eq!(
        store.put(stored.clone()).await.unwrap_err(),
        RequestStoreError::AlreadyExists(stored.id)
    );

    store.delete(stored.id).await.unwrap();
    store.delete(stored.id).await.unwrap();
    assert_eq!(
        store.get(stored.id).await.unwrap_err(),
        RequestStoreError::NotFound(stored.id)
    );
    store.ping().await.unwrap();
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn sweep_removes_expired_index_entries() {
    let (_container, backend) = setup().await;
    let store = backend.request_store();
    let short = request(chrono::Duration::seconds(1));
    let long = request(chrono::Duration::hours(1));
    store.put(short.clone()).await.unwrap();
    store.put(long.clone()).await.unwrap();

    let swept = store
        .sweep(chrono::Utc::now() + chrono::Duration::seconds(5))
        .await
        .unwrap();
    assert_eq!(swept, 1);
    assert!(store.get(long.id).await.is_ok());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn put_indexes_the_record_it_stores() {
    let (container, backend) = setup().await;
    let store = backend.request_store();
    let stored = request(chrono::Duration::hours(1));
    store.put(stored.clone()).await.unwrap();

    let mut conn = raw_connection(&container).await;
    let score: Option<i64> = redis::cmd("ZSCORE")
        .arg("storage:expiry")
        .arg(stored.id.to_string())
        .query_async(&mut conn)
        .await
        .unwrap();
    assert!(score.is_some_and(|s| s >= stored.expires_at.timestamp()));

    // A rejected put leaves the existing index entry alone
    let mut clash = request(chrono::Duration::minutes(1));
    clash.id = stored.id;
    assert!(store.put(clash).await.is_err());
    let again: Option<i64> = redis::cmd("ZSCORE")
        .arg("storage:expiry")
        .arg(stored.id.to_string())
        .query_async(&mut conn)
        .await
        .unwrap();
    assert_eq!(again, score);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn sweep_counts_only_records_it_deletes() {
    let (_container, backend) = setup().await;
    let store = backend.request_store();
    store.put(request(chrono::Duration::seconds(1))).await.unwrap();

    // Let Redis evict the record through EXAT first
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    let swept = store
        .sweep(chrono::Utc::now() + chrono::Duration::seconds(5))
        .await
        .unwrap();
    assert_eq!(swept, 0);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn group_delivery_ack_and_delete() {
    let (_container, backend) = setup().await;
    let log = backend.stream_log();
    let stream = StreamName::new("worker-kics");
    let group = GroupName::workers();

    let first = log.append(&stream, message()).await.unwrap();
    let second = log.append(&stream, message()).await.unwrap();
    assert!(second > first);

    let batch = log
        .read_group(&stream, &group, &ConsumerName::new("a"), 10, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(batch.iter().map(|d| d.entry_id).collect::<Vec<_>>(), vec![first, second]);
    assert!(batch.iter().all(|d| d.delivery_count == 1));

    let none = log
        .read_group(&stream, &group, &ConsumerName::new("b"), 10, Duration::from_millis(50))
        .await
        .unwrap();
    assert!(none.is_empty());

    log.ack(&stream, &group, first).await.unwrap();
    log.ack(&stream, &group, first).await.unwrap();
    log.delete(&stream, first).await.unwrap();
    let pending = log.pending(&stream, &group).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].entry_id, second);
    assert_eq!(pending[0].consumer.as_str(), "a");
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn ten_consumers_receive_each_entry_once() {
    let (_container, backend) = setup().await;
    let log = backend.stream_log();
    let stream = StreamName::new("worker-blackduck");

    let mut appended = BTreeSet::new();
    for _ in 0..10 {
        appended.insert(log.append(&stream, message()).await.unwrap());
    }

    let reads = (0..10).map(|i| {
        let log = log.clone();
        let stream = stream.clone();
        tokio::spawn(async move {
            log.read_group(
                &stream,
                &GroupName::workers(),
                &ConsumerName::new(format!("worker-{i}")),
                1,
                Duration::from_millis(200),
            )
            .await
            .unwrap()
        })
    });
    let delivered: BTreeSet<_> = futures::future::join_all(reads)
        .await
        .into_iter()
        .flat_map(|batch| batch.unwrap())
        .map(|d| d.entry_id)
        .collect();
    assert_eq!(delivered, appended);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn reclaim_after_idle_and_deleted_entries() {
    let (_container, backend) = setup().await;
    let log = backend.stream_log();
    let stream = StreamName::new("worker-kics");
    let group = GroupName::workers();
    let kept = log.append(&stream, message()).await.unwrap();
    let gone = log.append(&stream, message()).await.unwrap();
    log.read_group(&stream, &group, &ConsumerName::new("crashed"), 10, Duration::ZERO)
        .await
        .unwrap();
    log.delete(&stream, gone).await.unwrap();

    let early = log
        .reclaim(&stream, &group, &ConsumerName::new("b"), Duration::from_secs(60), 10)
        .await
        .unwrap();
    assert!(early.is_empty());

    tokio::time::sleep(Duration::from_millis(150)).await;
    let claimed = log
        .reclaim(&stream, &group, &ConsumerName::new("b"), Duration::from_millis(100), 10)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].entry_id, kept);
    assert_eq!(claimed[0].delivery_count, 2);
    assert_eq!(claimed[0].consumer.as_str(), "b");

    let pending = log.pending(&stream, &group).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].entry_id, kept);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn undecodable_entries_are_dropped() {
    let (container, backend) = setup().await;
    let log = backend.stream_log();
    let stream = StreamName::new("worker-kics");

    let mut conn = raw_connection(&container).await;
    let _: String = redis::cmd("XADD")
        .arg("worker-kics")
        .arg("*")
        .arg("data")
        .arg("not json")
        .query_async(&mut conn)
        .await
        .unwrap();
    let good = log.append(&stream, message()).await.unwrap();

    let batch = log
        .read_group(&stream, &GroupName::workers(), &ConsumerName::new("a"), 10, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].entry_id, good);
    assert_eq!(log.pending(&stream, &GroupName::workers()).await.unwrap().len(), 1);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn completion_ledger_inserts_once() {
    let (_container, backend) = setup().await;
    let ledger = backend.completion_ledger();
    let stored = request(chrono::Duration::hours(1));
    let worker = WorkerIdentity::new("kics-worker");
    let notice = |result: ScanResult| CompletionNotice {
        request_id: stored.id,
        worker_identity: worker.clone(),
        result,
    };

    let first = CompletionRecord::new(notice(ScanResult::default()), &stored, chrono::Utc::now());
    assert!(ledger.record(first.clone()).await.unwrap());
    let second = CompletionRecord::new(notice(ScanResult::failed("x")), &stored, chrono::Utc::now());
    assert!(!ledger.record(second).await.unwrap());

    let kept = ledger.get(stored.id, &worker).await.unwrap().unwrap();
    assert_eq!(kept.result_summary, first.result_summary);
    assert_eq!(ledger.list(stored.id).await.unwrap().len(), 1);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn completion_hashes_always_carry_an_expiry() {
    let (container, backend) = setup().await;
    let ledger = backend.completion_ledger();
    let stored = request(chrono::Duration::hours(1));
    let record = CompletionRecord::new(
        CompletionNotice {
            request_id: stored.id,
            worker_identity: WorkerIdentity::new("kics-worker"),
            result: ScanResult::default(),
        },
        &stored,
        chrono::Utc::now(),
    );
    assert!(ledger.record(record).await.unwrap());

    let mut conn = raw_connection(&container).await;
    let ttl: i64 = redis::cmd("TTL")
        .arg(format!("completions:{}", stored.id))
        .query_async(&mut conn)
        .await
        .unwrap();
    assert!(ttl > 0 && ttl <= 3_601, "ttl = {ttl}");
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn blocking_reads_do_not_hold_up_other_commands() {
    let (_container, backend) = setup().await;
    let log = backend.stream_log();
    let store = backend.request_store();
    let stream = StreamName::new("worker-idle");
    let group = GroupName::workers();
    // Create the group so the read goes straight to BLOCK
    assert!(
        log.read_group(&stream, &group, &ConsumerName::new("a"), 1, Duration::ZERO)
            .await
            .unwrap()
            .is_empty()
    );

    let reader = {
        let log = log.clone();
        let stream = stream.clone();
        tokio::spawn(async move {
            log.read_group(&stream, &group, &ConsumerName::new("a"), 1, Duration::from_secs(3))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    store.ping().await.unwrap();
    log.ping().await.unwrap();
    store.put(request(chrono::Duration::hours(1))).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));

    assert!(reader.await.unwrap().unwrap().is_empty());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn streams_cannot_use_store_key_names() {
    let (_container, backend) = setup().await;
    let log = backend.stream_log();
    let stream = StreamName::new("storage:expiry");
    assert_eq!(
        log.append(&stream, message()).await.unwrap_err(),
        StreamLogError::ReservedName(stream)
    );
}
