//! Stream entries.
//!
//! - [`EntryId`]: position of a message in one stream, assigned by the log
//! - [`StreamMessage`]: the routing envelope (request id + callback address)
//! - [`Delivery`]: a message handed to a consumer, with its delivery count
//! - [`PendingEntry`]: the consumer-group record for a delivered, unacked message

use crate::names::ConsumerName;
use crate::request::RequestId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for `EntryId` parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid entry ID: {0}")]
pub struct ParseEntryIdError(String);

/// Position of a message within one stream.
///
/// Ids have the form `<millis>-<seq>`: the append time in milliseconds and a
/// sequence number that disambiguates appends within the same millisecond (or
/// appends made while the clock appears to run backwards). Ids are unique and
/// strictly increasing per stream, and are only ever assigned by the log.
///
/// ```
/// use prscan_core::stream::EntryId;
///
/// let id: EntryId = "1700000000000-3".parse().unwrap();
/// assert_eq!(id.millis(), 1_700_000_000_000);
/// assert_eq!(id.seq(), 3);
/// assert!(id < EntryId::new(1_700_000_000_000, 4));
/// assert_eq!(id.to_string(), "1700000000000-3");
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId {
    millis: u64,
    seq: u64,
}

impl EntryId {
    /// Smallest possible id; every appended id is greater.
    pub const MIN: Self = Self { millis: 0, seq: 0 };

    /// Create an id from its parts.
    #[must_use]
    pub const fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }

    /// Millisecond component.
    #[must_use]
    pub const fn millis(self) -> u64 {
        self.millis
    }

    /// Sequence component.
    #[must_use]
    pub const fn seq(self) -> u64 {
        self.seq
    }

    /// The id to assign to the next append, given the last assigned id and the
    /// current time in milliseconds.
    ///
    /// Uses the clock when it has moved past `last`, otherwise bumps the
    /// sequence so ids never go backwards.
    #[must_use]
    pub const fn next_after(last: Option<Self>, now_millis: u64) -> Self {
        match last {
            Some(last) if now_millis <= last.millis => Self {
                millis: last.millis,
                seq: last.seq + 1,
            },
            _ => Self {
                millis: now_millis,
                seq: 0,
            },
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = ParseEntryIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (millis, seq) = s
            .split_once('-')
            .ok_or_else(|| ParseEntryIdError(s.to_string()))?;
        let millis = millis
            .parse()
            .map_err(|_| ParseEntryIdError(s.to_string()))?;
        let seq = seq.parse().map_err(|_| ParseEntryIdError(s.to_string()))?;
        Ok(Self { millis, seq })
    }
}

impl Serialize for EntryId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EntryId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Routing envelope appended to a stream.
///
/// Deliberately small: the full request stays in the request store. On the
/// wire the envelope is the JSON document `{"id": ..., "callback_url": ...}`
/// stored under the entry field [`StreamMessage::FIELD`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMessage {
    /// Request the worker should resolve
    #[serde(rename = "id")]
    pub request_id: RequestId,
    /// Where the worker reports completion
    #[serde(rename = "callback_url", default)]
    pub callback_address: String,
}

impl StreamMessage {
    /// Entry field holding the encoded envelope.
    pub const FIELD: &'static str = "data";

    /// Create an envelope.
    #[must_use]
    pub fn new(request_id: RequestId, callback_address: impl Into<String>) -> Self {
        Self {
            request_id,
            callback_address: callback_address.into(),
        }
    }

    /// Encode for storage in an entry field.
    ///
    /// # Errors
    ///
    /// Returns the serializer error (not expected for this type).
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode an entry field.
    ///
    /// # Errors
    ///
    /// Returns an error if the field is not a valid envelope.
    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// A message handed to a consumer by a group read or a reclaim.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    /// Position in the stream
    pub entry_id: EntryId,
    /// The envelope
    pub message: StreamMessage,
    /// Consumer now holding the message
    pub consumer: ConsumerName,
    /// Deliveries to any consumer of the group so far, this one included
    pub delivery_count: u32,
}

/// Consumer-group record of a delivered but not yet acknowledged message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEntry {
    /// Position in the stream
    pub entry_id: EntryId,
    /// Consumer currently holding the message
    pub consumer: ConsumerName,
    /// Time of the last (re)delivery
    pub delivered_at: DateTime<Utc>,
    /// Deliveries to any consumer of the group so far
    pub delivery_count: u32,
}
