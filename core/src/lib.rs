//! # prscan core
//!
//! Core types and storage traits for the prscan fan-out coordinator.
//!
//! A pull-request trigger becomes one [`WorkRequest`](request::WorkRequest) held
//! by a [`RequestStore`](request_store::RequestStore), and one small routing
//! envelope per target worker pool appended to a
//! [`StreamLog`](stream_log::StreamLog). Workers consume their stream under a
//! consumer group, scan, and report back through a callback that is correlated
//! against the stored request.
//!
//! ```text
//!  trigger ──► Dispatcher ──► RequestStore  (storage:{id}, expires_at)
//!                  │
//!                  ├──► stream "worker-kics"      ──► group "workers" ──► Worker Loop ─┐
//!                  └──► stream "worker-blackduck" ──► group "workers" ──► Worker Loop ─┤
//!                                                                                      │
//!                       CompletionLedger ◄── Callback Correlator ◄──── callback ───────┘
//! ```
//!
//! This crate only defines the vocabulary and the seams. Implementations:
//!
//! - `prscan-testing`: in-memory backends (single process, tests)
//! - `prscan-redis`: Redis streams / keys (production)
//! - `prscan-postgres`: dead-letter sink
//!
//! All seams are dyn-compatible so components can share them as `Arc<dyn Trait>`.

pub use chrono::{DateTime, Utc};

/// Names of streams, groups, consumers and workers
pub mod names;

/// Work requests and their identifiers
pub mod request;

/// Request store trait
pub mod request_store;

/// Stream entries, envelopes and pending-entry records
pub mod stream;

/// Stream log trait (append, group reads, ack, reclaim)
pub mod stream_log;

/// Dead-letter records and sink trait
pub mod dead_letter;

/// Scan results, completion notices and the completion ledger
pub mod completion;

/// Injected dependencies.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time so idle thresholds and expiry are testable
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall clock.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

pub use completion::{
    CheckConclusion, CompletionError, CompletionLedger, CompletionNotice, CompletionOutcome,
    CompletionRecord, CorrelatedCompletion, Finding, ScanResult, Severity,
};
pub use dead_letter::{
    Burial, DeadLetter, DeadLetterError, DeadLetterSink, DeadLetterStatus, FailureRecord,
};
pub use environment::{Clock, SystemClock};
pub use names::{ConsumerName, GroupName, StreamName, WorkerIdentity};
pub use request::{RequestId, RequestPayload, WorkRequest};
pub use request_store::{RequestStore, RequestStoreError};
pub use stream::{Delivery, EntryId, PendingEntry, StreamMessage};
pub use stream_log::{StreamLog, StreamLogError};
