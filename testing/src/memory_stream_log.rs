//! In-memory stream log.

#![allow(clippy::unwrap_used)] // Test infrastructure unwraps poisoned locks
#![allow(clippy::missing_panics_doc)]

use prscan_core::environment::{Clock, SystemClock};
use prscan_core::{
    ConsumerName, DateTime, Delivery, EntryId, GroupName, PendingEntry, StreamLog,
    StreamLogError, StreamMessage, StreamName, Utc,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug)]
struct PendingSlot {
    consumer: ConsumerName,
    delivered_at: DateTime<Utc>,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct GroupState {
    last_delivered: Option<EntryId>,
    pending: BTreeMap<EntryId, PendingSlot>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: BTreeMap<EntryId, StreamMessage>,
    last_id: Option<EntryId>,
    groups: HashMap<GroupName, GroupState>,
}

#[derive(Default)]
struct Faults {
    unavailable: bool,
    failing_streams: HashSet<StreamName>,
}

/// In-memory [`StreamLog`] with the same delivery semantics as the Redis
/// backend: per-group cursor, pending set, blocking reads and reclaim.
///
/// One mutex guards every stream, which makes `read_group` and `reclaim`
/// atomic. Blocking reads park on a [`Notify`] that every append wakes.
///
/// Faults can be injected with [`InMemoryStreamLog::set_unavailable`] and
/// [`InMemoryStreamLog::fail_appends_to`].
///
/// # Example
///
/// ```
/// use prscan_testing::InMemoryStreamLog;
/// use prscan_core::{GroupName, ConsumerName, RequestId, StreamLog, StreamMessage, StreamName};
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let log = InMemoryStreamLog::new();
/// let stream = StreamName::new("worker-kics");
/// log.append(&stream, StreamMessage::new(RequestId::generate(), "http://cb")).await?;
///
/// let batch = log
///     .read_group(&stream, &GroupName::workers(), &ConsumerName::new("a"), 1, Duration::ZERO)
///     .await?;
/// assert_eq!(batch.len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryStreamLog {
    streams: Arc<Mutex<HashMap<StreamName, StreamState>>>,
    appended: Arc<Notify>,
    faults: Arc<Mutex<Faults>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryStreamLog {
    /// Create an empty log on the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty log reading time from `clock` (entry ids, delivery
    /// times and idle checks).
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            streams: Arc::new(Mutex::new(HashMap::new())),
            appended: Arc::new(Notify::new()),
            faults: Arc::new(Mutex::new(Faults::default())),
            clock,
        }
    }

    /// Make every operation fail with [`StreamLogError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.lock().unwrap().unavailable = unavailable;
    }

    /// Make appends to `stream` fail while leaving other streams working.
    pub fn fail_appends_to(&self, stream: &StreamName) {
        self.faults
            .lock()
            .unwrap()
            .failing_streams
            .insert(stream.clone());
    }

    /// Undo [`InMemoryStreamLog::fail_appends_to`] for every stream.
    pub fn heal_appends(&self) {
        self.faults.lock().unwrap().failing_streams.clear();
    }

    /// Number of entries physically present in `stream`.
    #[must_use]
    pub fn len(&self, stream: &StreamName) -> usize {
        self.streams
            .lock()
            .unwrap()
            .get(stream)
            .map_or(0, |s| s.entries.len())
    }

    /// Whether `stream` holds no entries.
    #[must_use]
    pub fn is_empty(&self, stream: &StreamName) -> bool {
        self.len(stream) == 0
    }

    /// All entries currently present in `stream`, in id order.
    #[must_use]
    pub fn entries(&self, stream: &StreamName) -> Vec<(EntryId, StreamMessage)> {
        self.streams
            .lock()
            .unwrap()
            .get(stream)
            .map(|s| s.entries.iter().map(|(id, m)| (*id, m.clone())).collect())
            .unwrap_or_default()
    }

    fn check_available(&self) -> Result<(), StreamLogError> {
        if self.faults.lock().unwrap().unavailable {
            return Err(StreamLogError::Unavailable("injected fault".to_string()));
        }
        Ok(())
    }

    fn now_millis(&self) -> u64 {
        u64::try_from(self.clock.now().timestamp_millis()).unwrap_or(0)
    }

    fn idle_for(&self, since: DateTime<Utc>) -> Duration {
        (self.clock.now() - since).to_std().unwrap_or(Duration::ZERO)
    }

    fn deliver_new(
        &self,
        stream: &StreamName,
        group: &GroupName,
        consumer: &ConsumerName,
        max_count: usize,
    ) -> Vec<Delivery> {
        let now = self.clock.now();
        let mut streams = self.streams.lock().unwrap();
        let state = streams.entry(stream.clone()).or_default();
        let group_state = state.groups.entry(group.clone()).or_default();

        let start = group_state.last_delivered;
        let batch: Vec<(EntryId, StreamMessage)> = state
            .entries
            .iter()
            .filter(|(id, _)| start.is_none_or(|last| **id > last))
            .take(max_count)
            .map(|(id, m)| (*id, m.clone()))
            .collect();

        batch
            .into_iter()
            .map(|(entry_id, message)| {
                group_state.last_delivered = Some(entry_id);
                group_state.pending.insert(
                    entry_id,
                    PendingSlot {
                        consumer: consumer.clone(),
                        delivered_at: now,
                        delivery_count: 1,
                    },
                );
                Delivery {
                    entry_id,
                    message,
                    consumer: consumer.clone(),
                    delivery_count: 1,
                }
            })
            .collect()
    }
}

impl Default for InMemoryStreamLog {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryStreamLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStreamLog")
            .field("streams", &self.streams.lock().unwrap().len())
            .finish_non_exhaustive()
    }
}

impl StreamLog for InMemoryStreamLog {
    fn append(
        &self,
        stream: &StreamName,
        message: StreamMessage,
    ) -> Pin<Box<dyn Future<Output = Result<EntryId, StreamLogError>> + Send + '_>> {
        let stream = stream.clone();
        Box::pin(async move {
            self.check_available()?;
            if self.faults.lock().unwrap().failing_streams.contains(&stream) {
                return Err(StreamLogError::Unavailable(format!(
                    "injected append fault on {stream}"
                )));
            }

            let entry_id = {
                let mut streams = self.streams.lock().unwrap();
                let state = streams.entry(stream).or_default();
                let entry_id = EntryId::next_after(state.last_id, self.now_millis());
                state.last_id = Some(entry_id);
                state.entries.insert(entry_id, message);
                entry_id
            };
            self.appended.notify_waiters();
            Ok(entry_id)
        })
    }

    fn read_group(
        &self,
        stream: &StreamName,
        group: &GroupName,
        consumer: &ConsumerName,
        max_count: usize,
        block_timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Delivery>, StreamLogError>> + Send + '_>> {
        let stream = stream.clone();
        let group = group.clone();
        let consumer = consumer.clone();
        Box::pin(async move {
            self.check_available()?;
            let deadline = tokio::time::Instant::now() + block_timeout;
            loop {
                // Register interest before looking, so an append between the
                // check and the wait is not missed.
                let notified = self.appended.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let batch = self.deliver_new(&stream, &group, &consumer, max_count);
                if !batch.is_empty() {
                    return Ok(batch);
                }
                if tokio::time::timeout_at(deadline, notified).await.is_err() {
                    return Ok(Vec::new());
                }
                self.check_available()?;
            }
        })
    }

    fn ack(
        &self,
        stream: &StreamName,
        group: &GroupName,
        entry_id: EntryId,
    ) -> Pin<Box<dyn Future<Output = Result<(), StreamLogError>> + Send + '_>> {
        let stream = stream.clone();
        let group = group.clone();
        Box::pin(async move {
            self.check_available()?;
            let mut streams = self.streams.lock().unwrap();
            if let Some(group_state) = streams
                .get_mut(&stream)
                .and_then(|s| s.groups.get_mut(&group))
            {
                group_state.pending.remove(&entry_id);
            }
            Ok(())
        })
    }

    fn delete(
        &self,
        stream: &StreamName,
        entry_id: EntryId,
    ) -> Pin<Box<dyn Future<Output = Result<(), StreamLogError>> + Send + '_>> {
        let stream = stream.clone();
        Box::pin(async move {
            self.check_available()?;
            if let Some(state) = self.streams.lock().unwrap().get_mut(&stream) {
                state.entries.remove(&entry_id);
            }
            Ok(())
        })
    }

    fn reclaim(
        &self,
        stream: &StreamName,
        group: &GroupName,
        consumer: &ConsumerName,
        min_idle: Duration,
        max_count: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Delivery>, StreamLogError>> + Send + '_>> {
        let stream = stream.clone();
        let group = group.clone();
        let consumer = consumer.clone();
        Box::pin(async move {
            self.check_available()?;
            let now = self.clock.now();
            let mut streams = self.streams.lock().unwrap();
            let Some(state) = streams.get_mut(&stream) else {
                return Ok(Vec::new());
            };
            let Some(group_state) = state.groups.get_mut(&group) else {
                return Ok(Vec::new());
            };

            let idle: Vec<EntryId> = group_state
                .pending
                .iter()
                .filter(|(_, slot)| self.idle_for(slot.delivered_at) >= min_idle)
                .map(|(id, _)| *id)
                .collect();

            let mut claimed = Vec::new();
            for entry_id in idle {
                if claimed.len() >= max_count {
                    break;
                }
                let Some(message) = state.entries.get(&entry_id) else {
                    group_state.pending.remove(&entry_id);
                    continue;
                };
                if let Some(slot) = group_state.pending.get_mut(&entry_id) {
                    slot.consumer = consumer.clone();
                    slot.delivered_at = now;
                    slot.delivery_count += 1;
                    claimed.push(Delivery {
                        entry_id,
                        message: message.clone(),
                        consumer: consumer.clone(),
                        delivery_count: slot.delivery_count,
                    });
                }
            }
            Ok(claimed)
        })
    }

    fn pending(
        &self,
        stream: &StreamName,
        group: &GroupName,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<PendingEntry>, StreamLogError>> + Send + '_>> {
        let stream = stream.clone();
        let group = group.clone();
        Box::pin(async move {
            self.check_available()?;
            let streams = self.streams.lock().unwrap();
            Ok(streams
                .get(&stream)
                .and_then(|s| s.groups.get(&group))
                .map(|g| {
                    g.pending
                        .iter()
                        .map(|(id, slot)| PendingEntry {
                            entry_id: *id,
                            consumer: slot.consumer.clone(),
                            delivered_at: slot.delivered_at,
                            delivery_count: slot.delivery_count,
                        })
                        .collect()
                })
                .unwrap_or_default())
        })
    }

    fn ping(&self) -> Pin<Box<dyn Future<Output = Result<(), StreamLogError>> + Send + '_>> {
        Box::pin(async move { self.check_available() })
    }
}
