//! Delivery semantics of the in-memory stream log.
//!
//! These mirror the guarantees the Redis backend gets from `XREADGROUP` and
//! `XCLAIM`, so the runtime can be tested against either.

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::expect_used)] // Tests can expect

use futures::future::join_all;
use prscan_core::{
    Clock, ConsumerName, Delivery, EntryId, GroupName, RequestId, StreamLog, StreamMessage,
    StreamName,
};
use prscan_testing::{InMemoryStreamLog, ManualClock};
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

fn message() -> StreamMessage {
    StreamMessage::new(RequestId::generate(), "http://coordinator:8000/callbacks")
}

async fn append_n(log: &InMemoryStreamLog, stream: &StreamName, n: usize) -> Vec<EntryId> {
    let mut ids = Vec::with_capacity(n);
    for _ in 0..n {
        ids.push(log.append(stream, message()).await.unwrap());
    }
    ids
}

#[tokio::test]
async fn ten_consumers_split_ten_messages_exactly() {
    let log = InMemoryStreamLog::new();
    let stream = StreamName::new("worker-kics");
    let appended: BTreeSet<EntryId> = append_n(&log, &stream, 10).await.into_iter().collect();

    let reads = (0..10).map(|i| {
        let log = log.clone();
        let stream = stream.clone();
        tokio::spawn(async move {
            log.read_group(
                &stream,
                &GroupName::workers(),
                &ConsumerName::new(format!("worker-{i}")),
                1,
                Duration::from_millis(50),
            )
            .await
            .unwrap()
        })
    });
    let batches: Vec<_> = join_all(reads).await.into_iter().map(Result::unwrap).collect();

    assert!(batches.iter().all(|b| b.len() == 1));
    let delivered: BTreeSet<EntryId> = batches.iter().map(|b| b[0].entry_id).collect();
    assert_eq!(delivered, appended);

    let pending = log.pending(&stream, &GroupName::workers()).await.unwrap();
    assert_eq!(pending.len(), 10);
}

#[tokio::test]
async fn first_pass_is_in_append_order_across_consumers() {
    let log = InMemoryStreamLog::new();
    let stream = StreamName::new("s");
    let ids = append_n(&log, &stream, 3).await;
    let group = GroupName::workers();

    let mut seen = Vec::new();
    for consumer in ["a", "b", "a"] {
        let batch = log
            .read_group(&stream, &group, &ConsumerName::new(consumer), 1, Duration::ZERO)
            .await
            .unwrap();
        seen.push(batch[0].entry_id);
    }
    assert_eq!(seen, ids);

    let empty = log
        .read_group(&stream, &group, &ConsumerName::new("c"), 1, Duration::ZERO)
        .await
        .unwrap();
    assert!(empty.is_empty());
}

#[tokio::test]
async fn new_group_starts_from_the_beginning() {
    let log = InMemoryStreamLog::new();
    let stream = StreamName::new("s");
    let ids = append_n(&log, &stream, 2).await;

    let first = log
        .read_group(&stream, &GroupName::new("g1"), &ConsumerName::new("a"), 10, Duration::ZERO)
        .await
        .unwrap();
    let second = log
        .read_group(&stream, &GroupName::new("g2"), &ConsumerName::new("a"), 10, Duration::ZERO)
        .await
        .unwrap();

    let ids_of = |batch: &[Delivery]| batch.iter().map(|d| d.entry_id).collect::<Vec<_>>();
    assert_eq!(ids_of(&first), ids);
    assert_eq!(ids_of(&second), ids);
}

#[tokio::test]
async fn ack_twice_is_the_same_as_once() {
    let log = InMemoryStreamLog::new();
    let stream = StreamName::new("s");
    let group = GroupName::workers();
    let ids = append_n(&log, &stream, 2).await;
    log.read_group(&stream, &group, &ConsumerName::new("a"), 2, Duration::ZERO)
        .await
        .unwrap();

    log.ack(&stream, &group, ids[0]).await.unwrap();
    let after_one = log.pending(&stream, &group).await.unwrap();
    log.ack(&stream, &group, ids[0]).await.unwrap();
    let after_two = log.pending(&stream, &group).await.unwrap();
    assert_eq!(after_one, after_two);
    assert_eq!(after_two.len(), 1);

    // Unknown ids, groups and streams are no-ops too.
    log.ack(&stream, &group, EntryId::new(1, 99)).await.unwrap();
    log.ack(&stream, &GroupName::new("nobody"), ids[1]).await.unwrap();
    log.ack(&StreamName::new("missing"), &group, ids[1]).await.unwrap();
    assert_eq!(log.pending(&stream, &group).await.unwrap().len(), 1);
}

#[tokio::test]
async fn reclaim_respects_min_idle() {
    let clock = ManualClock::default();
    let log = InMemoryStreamLog::with_clock(Arc::new(clock.clone()));
    let stream = StreamName::new("s");
    let group = GroupName::workers();
    let ids = append_n(&log, &stream, 1).await;
    log.read_group(&stream, &group, &ConsumerName::new("a"), 1, Duration::ZERO)
        .await
        .unwrap();

    clock.advance(Duration::from_secs(59));
    let early = log
        .reclaim(&stream, &group, &ConsumerName::new("b"), Duration::from_secs(60), 10)
        .await
        .unwrap();
    assert!(early.is_empty());

    clock.advance(Duration::from_secs(1));
    let claimed = log
        .reclaim(&stream, &group, &ConsumerName::new("b"), Duration::from_secs(60), 10)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].entry_id, ids[0]);
    assert_eq!(claimed[0].delivery_count, 2);
    assert_eq!(claimed[0].consumer.as_str(), "b");

    let pending = log.pending(&stream, &group).await.unwrap();
    assert_eq!(pending[0].consumer.as_str(), "b");
    assert_eq!(pending[0].delivered_at, clock.now());

    // Reclaim refreshed the delivery time, so it is not idle any more.
    let again = log
        .reclaim(&stream, &group, &ConsumerName::new("c"), Duration::from_secs(60), 10)
        .await
        .unwrap();
    assert!(again.is_empty());
}

#[tokio::test]
async fn reclaim_drops_deleted_messages() {
    let clock = ManualClock::default();
    let log = InMemoryStreamLog::with_clock(Arc::new(clock.clone()));
    let stream = StreamName::new("s");
    let group = GroupName::workers();
    let ids = append_n(&log, &stream, 2).await;
    log.read_group(&stream, &group, &ConsumerName::new("a"), 2, Duration::ZERO)
        .await
        .unwrap();
    log.delete(&stream, ids[0]).await.unwrap();
    log.delete(&stream, ids[0]).await.unwrap();

    clock.advance(Duration::from_secs(120));
    let claimed = log
        .reclaim(&stream, &group, &ConsumerName::new("b"), Duration::from_secs(60), 10)
        .await
        .unwrap();
    assert_eq!(claimed.iter().map(|d| d.entry_id).collect::<Vec<_>>(), vec![ids[1]]);
    let pending = log.pending(&stream, &group).await.unwrap();
    assert_eq!(pending.len(), 1);
}

#[tokio::test]
async fn reclaimed_message_is_never_read_again() {
    let clock = ManualClock::default();
    let log = InMemoryStreamLog::with_clock(Arc::new(clock.clone()));
    let stream = StreamName::new("s");
    let group = GroupName::workers();
    append_n(&log, &stream, 1).await;
    log.read_group(&stream, &group, &ConsumerName::new("a"), 1, Duration::ZERO)
        .await
        .unwrap();
    clock.advance(Duration::from_secs(61));
    log.reclaim(&stream, &group, &ConsumerName::new("b"), Duration::from_secs(60), 1)
        .await
        .unwrap();

    let fresh = log
        .read_group(&stream, &group, &ConsumerName::new("c"), 10, Duration::ZERO)
        .await
        .unwrap();
    assert!(fresh.is_empty());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// However reads are interleaved between consumers, every entry is
    /// delivered exactly once per group, in append order.
    #[test]
    fn interleaved_reads_deliver_each_entry_once(
        n in 1usize..30,
        reads in proptest::collection::vec((0usize..4, 1usize..5), 1..40),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let log = InMemoryStreamLog::new();
            let stream = StreamName::new("s");
            let ids = append_n(&log, &stream, n).await;

            let mut delivered = Vec::new();
            for (consumer, count) in &reads {
                let batch = log
                    .read_group(
                        &stream,
                        &GroupName::workers(),
                        &ConsumerName::new(format!("c{consumer}")),
                        *count,
                        Duration::ZERO,
                    )
                    .await
                    .unwrap();
                delivered.extend(batch.into_iter().map(|d| d.entry_id));
            }

            let total: usize = reads.iter().map(|(_, c)| c).sum();
            prop_assert_eq!(&delivered[..], &ids[..total.min(n)]);
            Ok::<(), TestCaseError>(())
        })?;
    }
}
