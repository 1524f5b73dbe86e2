//! Stream log trait.
//!
//! A stream log holds named, append-only streams of [`StreamMessage`]s and
//! tracks, per stream and consumer group, which entries are delivered but not
//! yet acknowledged (the pending set).
//!
//! # Delivery semantics
//!
//! - Within one group every entry is delivered by [`StreamLog::read_group`] to
//!   exactly one consumer, in id order.
//! - A delivered entry stays pending for its consumer until acknowledged.
//! - The only handoff between consumers is [`StreamLog::reclaim`], which moves
//!   entries that have been idle long enough.
//! - Groups are independent: one entry can be pending in several groups.
//!
//! Group membership is implicit. Reading with a group name that has never been
//! used creates the group, positioned at the start of the stream.
//!
//! # Implementations
//!
//! - `InMemoryStreamLog` (`prscan-testing`)
//! - `RedisStreamLog` (`prscan-redis`): `XADD` / `XREADGROUP` / `XACK` /
//!   `XDEL` / `XCLAIM`

use crate::names::{ConsumerName, GroupName, StreamName};
use crate::stream::{Delivery, EntryId, PendingEntry, StreamMessage};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during stream log operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamLogError {
    /// Backing log unreachable or failed
    #[error("Stream log unavailable: {0}")]
    Unavailable(String),

    /// Envelope could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An entry exists but its envelope is unreadable
    #[error("Invalid entry {entry_id} in stream {stream}: {reason}")]
    InvalidEntry {
        /// Stream holding the entry
        stream: StreamName,
        /// Offending entry
        entry_id: EntryId,
        /// Decode failure
        reason: String,
    },

    /// The backend reserves this stream name for its own keys
    #[error("Stream name {0} is reserved")]
    ReservedName(StreamName),
}

impl StreamLogError {
    /// Whether retrying the same call later could succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Append-only, multi-consumer-group message log.
///
/// # Dyn Compatibility
///
/// Methods return `Pin<Box<dyn Future>>` so the log can be held as
/// `Arc<dyn StreamLog>` by the dispatcher and every worker loop.
pub trait StreamLog: Send + Sync {
    /// Append a message and return its assigned id.
    ///
    /// Appends to one stream are serialized by the log: ids are unique and
    /// strictly increasing within the stream.
    ///
    /// # Errors
    ///
    /// Returns [`StreamLogError::Unavailable`] if the log fails.
    fn append(
        &self,
        stream: &StreamName,
        message: StreamMessage,
    ) -> Pin<Box<dyn Future<Output = Result<EntryId, StreamLogError>> + Send + '_>>;

    /// Deliver up to `max_count` entries this group has never delivered.
    ///
    /// Returned entries are atomically marked pending for `consumer`, with a
    /// delivery count of 1. When nothing is available the call waits up to
    /// `block_timeout` for an append and returns an empty batch on timeout.
    ///
    /// Entries whose body cannot be decoded are never handed out: backends
    /// log them as [`StreamLogError::InvalidEntry`], then acknowledge and
    /// delete them.
    ///
    /// # Errors
    ///
    /// Returns [`StreamLogError::Unavailable`] if the log fails.
    fn read_group(
        &self,
        stream: &StreamName,
        group: &GroupName,
        consumer: &ConsumerName,
        max_count: usize,
        block_timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Delivery>, StreamLogError>> + Send + '_>>;

    /// Remove an entry from the group's pending set.
    ///
    /// Acknowledging an unknown or already acknowledged id is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`StreamLogError::Unavailable`] if the log fails.
    fn ack(
        &self,
        stream: &StreamName,
        group: &GroupName,
        entry_id: EntryId,
    ) -> Pin<Box<dyn Future<Output = Result<(), StreamLogError>> + Send + '_>>;

    /// Physically remove an entry from the stream. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`StreamLogError::Unavailable`] if the log fails.
    fn delete(
        &self,
        stream: &StreamName,
        entry_id: EntryId,
    ) -> Pin<Box<dyn Future<Output = Result<(), StreamLogError>> + Send + '_>>;

    /// Take over pending entries idle for at least `min_idle`.
    ///
    /// Each returned entry is reassigned to `consumer`, its delivery count is
    /// incremented and its delivery time refreshed. Pending entries whose
    /// message has been deleted are dropped from the pending set and not
    /// returned. At most `max_count` entries are returned, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StreamLogError::Unavailable`] if the log fails.
    fn reclaim(
        &self,
        stream: &StreamName,
        group: &GroupName,
        consumer: &ConsumerName,
        min_idle: Duration,
        max_count: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Delivery>, StreamLogError>> + Send + '_>>;

    /// Snapshot of the group's pending set, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StreamLogError::Unavailable`] if the log fails.
    fn pending(
        &self,
        stream: &StreamName,
        group: &GroupName,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<PendingEntry>, StreamLogError>> + Send + '_>>;

    /// Liveness probe for health reporting.
    ///
    /// # Errors
    ///
    /// Returns [`StreamLogError::Unavailable`] if the log is unreachable.
    fn ping(&self) -> Pin<Box<dyn Future<Output = Result<(), StreamLogError>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }
}
