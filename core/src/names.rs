//! Strongly typed names.
//!
//! Streams, consumer groups, consumers and worker identities are all strings on
//! the wire, but mixing them up (acking against a consumer name instead of a
//! group, say) is an easy mistake. Each gets its own newtype.
//!
//! # Validation
//!
//! - `FromStr::from_str()` and `Deserialize`: reject empty or whitespace-only
//!   input
//! - `new()` / `From`: no validation, for application-controlled values
//!
//! ```
//! use prscan_core::names::{GroupName, StreamName};
//!
//! let stream = StreamName::new("worker-kics");
//! assert_eq!(stream.as_str(), "worker-kics");
//!
//! let group: GroupName = "workers".parse().unwrap();
//! assert_eq!(group, GroupName::new("workers"));
//! assert!("".parse::<GroupName>().is_err());
//! ```

use serde::{Deserialize, Deserializer, Serialize, de};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for name parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid {kind}: {reason}")]
pub struct ParseNameError {
    kind: &'static str,
    reason: &'static str,
}

macro_rules! name_type {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                raw.parse().map_err(de::Error::custom)
            }
        }

        impl $name {
            #[doc = concat!("Create a new ", $kind, " without validation.")]
            #[must_use]
            pub fn new(name: impl Into<String>) -> Self {
                Self(name.into())
            }

            #[doc = concat!("Get the ", $kind, " as a string slice.")]
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            #[doc = concat!("Convert the ", $kind, " into its inner `String`.")]
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseNameError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                if s.trim().is_empty() {
                    return Err(ParseNameError {
                        kind: $kind,
                        reason: "cannot be empty",
                    });
                }
                Ok(Self(s.to_string()))
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

name_type!(
    /// Name of a stream, one per target worker pool (e.g. `worker-kics`).
    StreamName,
    "stream name"
);

name_type!(
    /// Name of a consumer group. Membership is implicit: any consumer that reads
    /// with this group name is part of it.
    GroupName,
    "group name"
);

name_type!(
    /// Name of one consumer instance inside a group (usually the pod/host name).
    ConsumerName,
    "consumer name"
);

name_type!(
    /// Identity a worker reports completions under (e.g. `kics-worker`).
    ///
    /// Completions are deduplicated per `(request_id, worker_identity)`.
    WorkerIdentity,
    "worker identity"
);

impl GroupName {
    /// Default group every scanner pool consumes under.
    #[must_use]
    pub fn workers() -> Self {
        Self::new("workers")
    }
}
