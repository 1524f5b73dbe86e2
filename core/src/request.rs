//! Work requests.
//!
//! A [`WorkRequest`] is the full context every scanner needs (repository
//! coordinates, revision, installation) stored once per trigger. Stream
//! messages only carry its [`RequestId`].

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Error type for `RequestId` parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid request ID: {0}")]
pub struct ParseRequestIdError(String);

/// Opaque, time-sortable request identifier (UUIDv7).
///
/// Ids generated later compare greater (to millisecond precision), which keeps
/// log output and store listings in rough creation order.
///
/// ```
/// use prscan_core::request::RequestId;
///
/// let id = RequestId::generate();
/// let parsed: RequestId = id.to_string().parse().unwrap();
/// assert_eq!(id, parsed);
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generate a fresh id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The inner UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RequestId {
    type Err = ParseRequestIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| ParseRequestIdError(format!("{s}: {e}")))
    }
}

/// Caller-supplied fields shared by every scanner.
///
/// The named fields are the ones the coordinator itself reads (for logging and
/// for merging into completions). Anything else the trigger sends is kept in
/// `extra` and passed through untouched.
///
/// Field aliases accept the camelCase names older producers wrote.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestPayload {
    /// Repository owner (user or organisation)
    pub owner: String,
    /// Repository name
    #[serde(alias = "name")]
    pub repo: String,
    /// Head branch of the pull request
    pub branch: String,
    /// Pull request number
    #[serde(alias = "prId")]
    pub pr_id: u64,
    /// Head commit of the pull request
    #[serde(default, alias = "commitSha")]
    pub commit_sha: String,
    /// GitHub App installation the scan authenticates as
    #[serde(default, alias = "installation_id", alias = "installId")]
    pub install_id: Option<u64>,
    /// Originating trace id, propagated into worker logs
    #[serde(default, alias = "traceId")]
    pub trace_id: Option<String>,
    /// Pass-through fields
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RequestPayload {
    /// `owner/repo` slug.
    #[must_use]
    pub fn slug(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}

/// One unit of fan-out-able work.
///
/// Created exactly once by the dispatcher, never mutated afterwards. Every
/// request carries an expiry; the retention sweep removes it once passed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkRequest {
    /// Request identifier
    pub id: RequestId,
    /// Scanner-facing context
    pub payload: RequestPayload,
    /// When the dispatcher created the request
    pub created_at: DateTime<Utc>,
    /// After this instant the request may be swept
    pub expires_at: DateTime<Utc>,
    /// Number of streams the request was fanned out to
    pub expected_completions: u32,
}

impl WorkRequest {
    /// Create a request that expires `ttl` after `created_at`.
    #[must_use]
    pub fn new(
        id: RequestId,
        payload: RequestPayload,
        created_at: DateTime<Utc>,
        ttl: Duration,
        expected_completions: u32,
    ) -> Self {
        Self {
            id,
            payload,
            created_at,
            expires_at: created_at + ttl,
            expected_completions,
        }
    }

    /// Whether the request is past its expiry at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn payload() -> RequestPayload {
        RequestPayload {
            owner: "octocat".into(),
            repo: "hello-world".into(),
            branch: "feature-branch".into(),
            pr_id: 42,
            commit_sha: "abc123".into(),
            install_id: Some(7),
            trace_id: None,
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn expiry_is_inclusive() {
        let created = Utc::now();
        let request = WorkRequest::new(RequestId::generate(), payload(), created, Duration::hours(1), 2);
        assert!(!request.is_expired(created));
        assert!(request.is_expired(created + Duration::hours(1)));
    }

    #[test]
    fn payload_accepts_legacy_field_names() {
        let json = serde_json::json!({
            "owner": "octocat",
            "name": "repo",
            "branch": "feature-branch",
            "prId": 42,
            "installation_id": 9,
            "labels": ["security"]
        });
        let parsed: RequestPayload = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.repo, "repo");
        assert_eq!(parsed.pr_id, 42);
        assert_eq!(parsed.install_id, Some(9));
        assert!(parsed.commit_sha.is_empty());
        assert_eq!(parsed.extra["labels"], serde_json::json!(["security"]));
    }

    #[test]
    fn later_ids_sort_after_earlier_ones() {
        let first = RequestId::generate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = RequestId::generate();
        assert!(first < second);
    }

    #[test]
    fn request_id_rejects_garbage() {
        assert!("not-a-uuid".parse::<RequestId>().is_err());
    }
}
