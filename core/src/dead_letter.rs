//! Dead letters.
//!
//! A message whose handler keeps failing is eventually buried: removed from its
//! stream and parked in a [`DeadLetterSink`] together with every failed attempt,
//! until an operator replays or discards it.
//!
//! Failed attempts are journalled as they happen
//! ([`DeadLetterSink::record_failure`]), so the history survives worker
//! crashes and reclaims, and [`DeadLetterSink::bury`] assembles it into the
//! final [`DeadLetter`].

use crate::names::{ConsumerName, GroupName, StreamName};
use crate::stream::{EntryId, StreamMessage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Operator status of a dead letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeadLetterStatus {
    /// Waiting for an operator
    Pending,
    /// Re-appended to its stream
    Replayed,
    /// Permanently abandoned
    Discarded,
}

impl DeadLetterStatus {
    /// Storage representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Replayed => "replayed",
            Self::Discarded => "discarded",
        }
    }

    /// Parse the storage representation.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Serialization`] for unknown values.
    pub fn parse(s: &str) -> Result<Self, DeadLetterError> {
        match s {
            "pending" => Ok(Self::Pending),
            "replayed" => Ok(Self::Replayed),
            "discarded" => Ok(Self::Discarded),
            _ => Err(DeadLetterError::Serialization(format!(
                "Invalid dead letter status: {s}"
            ))),
        }
    }
}

/// One failed delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Delivery count at the time of the failure
    pub attempt: u32,
    /// Consumer that was processing the message
    pub consumer: ConsumerName,
    /// Handler error, as displayed
    pub error: String,
    /// When the attempt failed
    pub failed_at: DateTime<Utc>,
}

/// A buried message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Stream the message was appended to
    pub stream: StreamName,
    /// Original entry id
    pub entry_id: EntryId,
    /// Consumer group that gave up on it
    pub group: GroupName,
    /// The envelope, as appended
    pub message: StreamMessage,
    /// Deliveries made before burial
    pub delivery_count: u32,
    /// Failed attempts, oldest first
    pub failures: Vec<FailureRecord>,
    /// When the message was buried
    pub dead_lettered_at: DateTime<Utc>,
    /// Operator status
    pub status: DeadLetterStatus,
    /// When the letter was replayed or discarded
    pub resolved_at: Option<DateTime<Utc>>,
    /// Who resolved it
    pub resolved_by: Option<String>,
    /// Free-form resolution notes
    pub resolution_notes: Option<String>,
}

impl DeadLetter {
    /// Most recent failure, if any were journalled.
    #[must_use]
    pub fn last_failure(&self) -> Option<&FailureRecord> {
        self.failures.last()
    }
}

/// Everything the worker knows about a message when it gives up on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Burial {
    /// Stream the message came from
    pub stream: StreamName,
    /// Entry id in that stream
    pub entry_id: EntryId,
    /// Group that gave up
    pub group: GroupName,
    /// The envelope
    pub message: StreamMessage,
    /// Deliveries made so far
    pub delivery_count: u32,
    /// Burial time
    pub dead_lettered_at: DateTime<Utc>,
}

/// Errors that can occur during dead-letter operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterError {
    /// No dead letter for this key
    #[error("Dead letter not found: {stream}/{entry_id}")]
    NotFound {
        /// Stream
        stream: StreamName,
        /// Entry id
        entry_id: EntryId,
    },

    /// The letter was already replayed or discarded
    #[error("Dead letter {stream}/{entry_id} already {}", status.as_str())]
    AlreadyResolved {
        /// Stream
        stream: StreamName,
        /// Entry id
        entry_id: EntryId,
        /// Current status
        status: DeadLetterStatus,
    },

    /// Backing storage unreachable or failed
    #[error("Dead letter sink unavailable: {0}")]
    Unavailable(String),

    /// Stored record could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Terminal sink for poison messages, with an operator workflow.
///
/// Dead letters are keyed by `(stream, entry_id)`.
pub trait DeadLetterSink: Send + Sync {
    /// Journal one failed attempt for a message still in flight.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Unavailable`] if the sink fails.
    fn record_failure(
        &self,
        stream: &StreamName,
        entry_id: EntryId,
        failure: FailureRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>>;

    /// Drop the failure journal of a message that eventually succeeded.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Unavailable`] if the sink fails.
    fn clear_failures(
        &self,
        stream: &StreamName,
        entry_id: EntryId,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>>;

    /// Bury a message, attaching its journalled failures.
    ///
    /// Burying a key twice replaces the earlier letter and resets it to
    /// [`DeadLetterStatus::Pending`].
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Unavailable`] if the sink fails.
    fn bury(
        &self,
        burial: Burial,
    ) -> Pin<Box<dyn Future<Output = Result<DeadLetter, DeadLetterError>> + Send + '_>>;

    /// List letters, oldest burial first, optionally filtered by status.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Unavailable`] if the sink fails.
    fn list(
        &self,
        status: Option<DeadLetterStatus>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeadLetter>, DeadLetterError>> + Send + '_>>;

    /// Fetch one letter.
    ///
    /// # Errors
    ///
    /// - [`DeadLetterError::NotFound`] if there is no such letter
    /// - [`DeadLetterError::Unavailable`] if the sink fails
    fn get(
        &self,
        stream: &StreamName,
        entry_id: EntryId,
    ) -> Pin<Box<dyn Future<Output = Result<DeadLetter, DeadLetterError>> + Send + '_>>;

    /// Resolve a pending letter with `status`, recording who and why.
    ///
    /// # Errors
    ///
    /// - [`DeadLetterError::NotFound`] if there is no such letter
    /// - [`DeadLetterError::AlreadyResolved`] if it is not pending
    /// - [`DeadLetterError::Unavailable`] if the sink fails
    fn resolve(
        &self,
        stream: &StreamName,
        entry_id: EntryId,
        status: DeadLetterStatus,
        resolved_by: String,
        notes: Option<String>,
    ) -> Pin<Box<dyn Future<Output = Result<DeadLetter, DeadLetterError>> + Send + '_>>;

    /// Number of letters awaiting an operator.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Unavailable`] if the sink fails.
    fn count_pending(&self) -> Pin<Box<dyn Future<Output = Result<u64, DeadLetterError>> + Send + '_>>;
}
