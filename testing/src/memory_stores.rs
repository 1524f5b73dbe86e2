//! In-memory request store, completion ledger and dead-letter sink.

#![allow(clippy::unwrap_used)] // Test infrastructure unwraps poisoned locks
#![allow(clippy::missing_panics_doc)]

use prscan_core::environment::{Clock, SystemClock};
use prscan_core::{
    Burial, CompletionError, CompletionLedger, CompletionRecord, DateTime, DeadLetter,
    DeadLetterError, DeadLetterSink, DeadLetterStatus, EntryId, FailureRecord, RequestId,
    RequestStore, RequestStoreError, StreamName, Utc, WorkRequest, WorkerIdentity,
};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// In-memory [`RequestStore`].
///
/// Expired requests read as not found straight away, and stay in the map until
/// [`RequestStore::sweep`] removes them, just like the Redis index.
///
/// # Example
///
/// ```
/// use prscan_testing::{InMemoryRequestStore, helpers::sample_payload};
/// use prscan_core::{RequestId, RequestStore, WorkRequest};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryRequestStore::new();
/// let request = WorkRequest::new(
///     RequestId::generate(),
///     sample_payload(),
///     chrono::Utc::now(),
///     chrono::Duration::hours(1),
///     1,
/// );
/// store.put(request.clone()).await?;
/// assert_eq!(store.get(request.id).await?, request);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryRequestStore {
    requests: Arc<RwLock<HashMap<RequestId, WorkRequest>>>,
    unavailable: Arc<AtomicBool>,
    clock: Arc<dyn Clock>,
}

impl InMemoryRequestStore {
    /// Create an empty store on the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store that judges expiry by `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            requests: Arc::new(RwLock::new(HashMap::new())),
            unavailable: Arc::new(AtomicBool::new(false)),
            clock,
        }
    }

    /// Make every operation fail with [`RequestStoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of stored requests, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.requests.read().unwrap().len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a record for `id` is physically present (expired or not).
    #[must_use]
    pub fn contains(&self, id: RequestId) -> bool {
        self.requests.read().unwrap().contains_key(&id)
    }

    fn check_available(&self) -> Result<(), RequestStoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RequestStoreError::Unavailable("injected fault".to_string()));
        }
        Ok(())
    }
}

impl Default for InMemoryRequestStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryRequestStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryRequestStore")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl RequestStore for InMemoryRequestStore {
    fn put(
        &self,
        request: WorkRequest,
    ) -> Pin<Box<dyn Future<Output = Result<(), RequestStoreError>> + Send + '_>> {
        Box::pin(async move {
            self.check_available()?;
            let now = self.clock.now();
            let mut requests = self.requests.write().unwrap();
            if requests.get(&request.id).is_some_and(|r| !r.is_expired(now)) {
                return Err(RequestStoreError::AlreadyExists(request.id));
            }
            requests.insert(request.id, request);
            Ok(())
        })
    }

    fn get(
        &self,
        id: RequestId,
    ) -> Pin<Box<dyn Future<Output = Result<WorkRequest, RequestStoreError>> + Send + '_>> {
        Box::pin(async move {
            self.check_available()?;
            let now = self.clock.now();
            self.requests
                .read()
                .unwrap()
                .get(&id)
                .filter(|r| !r.is_expired(now))
                .cloned()
                .ok_or(RequestStoreError::NotFound(id))
        })
    }

    fn delete(
        &self,
        id: RequestId,
    ) -> Pin<Box<dyn Future<Output = Result<(), RequestStoreError>> + Send + '_>> {
        Box::pin(async move {
            self.check_available()?;
            self.requests.write().unwrap().remove(&id);
            Ok(())
        })
    }

    fn sweep(
        &self,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<usize, RequestStoreError>> + Send + '_>> {
        Box::pin(async move {
            self.check_available()?;
            let mut requests = self.requests.write().unwrap();
            let before = requests.len();
            requests.retain(|_, r| !r.is_expired(now));
            Ok(before - requests.len())
        })
    }

    fn ping(&self) -> Pin<Box<dyn Future<Output = Result<(), RequestStoreError>> + Send + '_>> {
        Box::pin(async move { self.check_available() })
    }
}

/// In-memory [`CompletionLedger`].
#[derive(Clone, Debug, Default)]
pub struct InMemoryCompletionLedger {
    records: Arc<RwLock<BTreeMap<(RequestId, WorkerIdentity), CompletionRecord>>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryCompletionLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with [`CompletionError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    /// Whether the ledger is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<(), CompletionError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CompletionError::Unavailable("injected fault".to_string()));
        }
        Ok(())
    }
}

impl CompletionLedger for InMemoryCompletionLedger {
    fn record(
        &self,
        record: CompletionRecord,
    ) -> Pin<Box<dyn Future<Output = Result<bool, CompletionError>> + Send + '_>> {
        Box::pin(async move {
            self.check_available()?;
            let key = (record.request_id, record.worker_identity.clone());
            let mut records = self.records.write().unwrap();
            if records.contains_key(&key) {
                return Ok(false);
            }
            records.insert(key, record);
            Ok(true)
        })
    }

    fn get(
        &self,
        request_id: RequestId,
        worker: &WorkerIdentity,
    ) -> Pin<Box<dyn Future<Output = Result<Option<CompletionRecord>, CompletionError>> + Send + '_>>
    {
        let key = (request_id, worker.clone());
        Box::pin(async move {
            self.check_available()?;
            Ok(self.records.read().unwrap().get(&key).cloned())
        })
    }

    fn list(
        &self,
        request_id: RequestId,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<CompletionRecord>, CompletionError>> + Send + '_>>
    {
        Box::pin(async move {
            self.check_available()?;
            Ok(self
                .records
                .read()
                .unwrap()
                .iter()
                .filter(|((id, _), _)| *id == request_id)
                .map(|(_, record)| record.clone())
                .collect())
        })
    }

    fn sweep(
        &self,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<usize, CompletionError>> + Send + '_>> {
        Box::pin(async move {
            self.check_available()?;
            let mut records = self.records.write().unwrap();
            let before = records.len();
            records.retain(|_, r| r.expires_at > now);
            Ok(before - records.len())
        })
    }
}

type LetterKey = (StreamName, EntryId);

/// In-memory [`DeadLetterSink`].
#[derive(Clone)]
pub struct InMemoryDeadLetterSink {
    journal: Arc<RwLock<HashMap<LetterKey, Vec<FailureRecord>>>>,
    letters: Arc<RwLock<HashMap<LetterKey, DeadLetter>>>,
    unavailable: Arc<AtomicBool>,
    clock: Arc<dyn Clock>,
}

impl InMemoryDeadLetterSink {
    /// Create an empty sink on the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty sink stamping resolutions with `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            journal: Arc::new(RwLock::new(HashMap::new())),
            letters: Arc::new(RwLock::new(HashMap::new())),
            unavailable: Arc::new(AtomicBool::new(false)),
            clock,
        }
    }

    /// Make every operation fail with [`DeadLetterError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Journalled failures of a message not (yet) buried.
    #[must_use]
    pub fn journalled(&self, stream: &StreamName, entry_id: EntryId) -> Vec<FailureRecord> {
        self.journal
            .read()
            .unwrap()
            .get(&(stream.clone(), entry_id))
            .cloned()
            .unwrap_or_default()
    }

    /// Number of letters, whatever their status.
    #[must_use]
    pub fn len(&self) -> usize {
        self.letters.read().unwrap().len()
    }

    /// Whether no message was ever buried.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<(), DeadLetterError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DeadLetterError::Unavailable("injected fault".to_string()));
        }
        Ok(())
    }
}

impl Default for InMemoryDeadLetterSink {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryDeadLetterSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryDeadLetterSink")
            .field("letters", &self.len())
            .finish_non_exhaustive()
    }
}

impl DeadLetterSink for InMemoryDeadLetterSink {
    fn record_failure(
        &self,
        stream: &StreamName,
        entry_id: EntryId,
        failure: FailureRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>> {
        let key = (stream.clone(), entry_id);
        Box::pin(async move {
            self.check_available()?;
            self.journal
                .write()
                .unwrap()
                .entry(key)
                .or_default()
                .push(failure);
            Ok(())
        })
    }

    fn clear_failures(
        &self,
        stream: &StreamName,
        entry_id: EntryId,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>> {
        let key = (stream.clone(), entry_id);
        Box::pin(async move {
            self.check_available()?;
            self.journal.write().unwrap().remove(&key);
            Ok(())
        })
    }

    fn bury(
        &self,
        burial: Burial,
    ) -> Pin<Box<dyn Future<Output = Result<DeadLetter, DeadLetterError>> + Send + '_>> {
        Box::pin(async move {
            self.check_available()?;
            let key = (burial.stream.clone(), burial.entry_id);
            let mut failures = self.journal.write().unwrap().remove(&key).unwrap_or_default();
            failures.sort_by_key(|f| (f.attempt, f.failed_at));

            let letter = DeadLetter {
                stream: burial.stream,
                entry_id: burial.entry_id,
                group: burial.group,
                message: burial.message,
                delivery_count: burial.delivery_count,
                failures,
                dead_lettered_at: burial.dead_lettered_at,
                status: DeadLetterStatus::Pending,
                resolved_at: None,
                resolved_by: None,
                resolution_notes: None,
            };
            self.letters.write().unwrap().insert(key, letter.clone());
            Ok(letter)
        })
    }

    fn list(
        &self,
        status: Option<DeadLetterStatus>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeadLetter>, DeadLetterError>> + Send + '_>> {
        Box::pin(async move {
            self.check_available()?;
            let mut letters: Vec<DeadLetter> = self
                .letters
                .read()
                .unwrap()
                .values()
                .filter(|l| status.is_none_or(|s| l.status == s))
                .cloned()
                .collect();
            letters.sort_by(|a, b| {
                (a.dead_lettered_at, &a.stream, a.entry_id).cmp(&(
                    b.dead_lettered_at,
                    &b.stream,
                    b.entry_id,
                ))
            });
            letters.truncate(limit);
            Ok(letters)
        })
    }

    fn get(
        &self,
        stream: &StreamName,
        entry_id: EntryId,
    ) -> Pin<Box<dyn Future<Output = Result<DeadLetter, DeadLetterError>> + Send + '_>> {
        let stream = stream.clone();
        Box::pin(async move {
            self.check_available()?;
            self.letters
                .read()
                .unwrap()
                .get(&(stream.clone(), entry_id))
                .cloned()
                .ok_or(DeadLetterError::NotFound { stream, entry_id })
        })
    }

    fn resolve(
        &self,
        stream: &StreamName,
        entry_id: EntryId,
        status: DeadLetterStatus,
        resolved_by: String,
        notes: Option<String>,
    ) -> Pin<Box<dyn Future<Output = Result<DeadLetter, DeadLetterError>> + Send + '_>> {
        let stream = stream.clone();
        Box::pin(async move {
            self.check_available()?;
            let mut letters = self.letters.write().unwrap();
            let Some(letter) = letters.get_mut(&(stream.clone(), entry_id)) else {
                return Err(DeadLetterError::NotFound { stream, entry_id });
            };
            if letter.status != DeadLetterStatus::Pending {
                return Err(DeadLetterError::AlreadyResolved {
                    stream,
                    entry_id,
                    status: letter.status,
                });
            }
            letter.status = status;
            letter.resolved_at = Some(self.clock.now());
            letter.resolved_by = Some(resolved_by);
            letter.resolution_notes = notes;
            Ok(letter.clone())
        })
    }

    fn count_pending(&self) -> Pin<Box<dyn Future<Output = Result<u64, DeadLetterError>> + Send + '_>> {
        Box::pin(async move {
            self.check_available()?;
            let count = self
                .letters
                .read()
                .unwrap()
                .values()
                .filter(|l| l.status == DeadLetterStatus::Pending)
                .count();
            Ok(count as u64)
        })
    }
}
