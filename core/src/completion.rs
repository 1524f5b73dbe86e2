//! Scan results and completions.
//!
//! Workers report one [`CompletionNotice`] per request they processed. The
//! correlator joins it to the stored request and records it in a
//! [`CompletionLedger`], which deduplicates by `(request_id, worker_identity)`.
//!
//! The core does not interpret [`ScanResult`] beyond the summary and check
//! conclusion helpers; unknown fields are carried through untouched.

use crate::names::WorkerIdentity;
use crate::request::{RequestId, WorkRequest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Finding severity, as scanners report it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    /// Blocks the pull request
    Critical,
    /// Should be fixed before merge
    High,
    /// Worth a look
    Medium,
    /// Minor
    Low,
    /// Informational only
    Info,
}

impl Severity {
    /// Key used in severity count maps.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "CRITICAL",
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Low => "LOW",
            Self::Info => "INFO",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One issue reported by a scanner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    /// Rule or query that matched
    #[serde(alias = "query_name")]
    pub rule: String,
    /// Reported severity (free-form; scanners are not uniform)
    pub severity: String,
    /// File the finding points at
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// Line within `file`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u64>,
    /// Human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Scanner-specific fields
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Conclusion of the GitHub check run a result maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckConclusion {
    /// No blocking findings
    Success,
    /// High findings but nothing critical
    Neutral,
    /// Scan failed or found critical issues
    Failure,
}

/// Output of one scanner for one request.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScanResult {
    /// Whether the scan itself ran to completion
    pub success: bool,
    /// Findings per severity
    #[serde(default, alias = "severity_counters")]
    pub severity_counts: BTreeMap<String, u64>,
    /// Individual findings
    #[serde(default, alias = "queries")]
    pub findings: Vec<Finding>,
    /// Why the scan failed, when it did
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Scanner statistics and anything else the worker sent
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ScanResult {
    /// A failed scan carrying only an error message.
    #[must_use]
    pub fn failed(error_message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_message: Some(error_message.into()),
            ..Self::default()
        }
    }

    /// Findings reported at `severity`.
    #[must_use]
    pub fn count(&self, severity: Severity) -> u64 {
        self.severity_counts
            .get(severity.as_str())
            .copied()
            .unwrap_or(0)
    }

    /// Total findings across severities.
    #[must_use]
    pub fn total_issues(&self) -> u64 {
        self.severity_counts.values().sum()
    }

    /// Check-run conclusion for this result.
    ///
    /// Failure when the scan failed or found anything critical, neutral when
    /// it found high-severity issues, success otherwise.
    #[must_use]
    pub fn conclusion(&self) -> CheckConclusion {
        if !self.success || self.count(Severity::Critical) > 0 {
            CheckConclusion::Failure
        } else if self.count(Severity::High) > 0 {
            CheckConclusion::Neutral
        } else {
            CheckConclusion::Success
        }
    }

    /// One-line summary, stored with the completion record.
    #[must_use]
    pub fn summary(&self) -> String {
        if !self.success {
            return format!(
                "scan failed: {}",
                self.error_message.as_deref().unwrap_or("unknown error")
            );
        }
        let total = self.total_issues();
        if total == 0 {
            return "no issues".to_string();
        }
        let breakdown = [Severity::Critical, Severity::High, Severity::Medium, Severity::Low]
            .into_iter()
            .filter_map(|s| {
                let n = self.count(s);
                (n > 0).then(|| format!("{} {n}", s.as_str().to_lowercase()))
            })
            .collect::<Vec<_>>()
            .join(", ");
        if breakdown.is_empty() {
            format!("{total} issues")
        } else {
            format!("{total} issues ({breakdown})")
        }
    }
}

/// Inbound completion callback.
///
/// Older workers send `id` and `app_name`; both are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionNotice {
    /// Request the scan was for
    #[serde(alias = "id")]
    pub request_id: RequestId,
    /// Reporting worker pool
    #[serde(alias = "app_name")]
    pub worker_identity: WorkerIdentity,
    /// The scan result
    pub result: ScanResult,
}

/// Stored completion, used to detect duplicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRecord {
    /// Request id
    pub request_id: RequestId,
    /// Reporting worker pool
    pub worker_identity: WorkerIdentity,
    /// [`ScanResult::summary`] of `result`
    pub result_summary: String,
    /// Full result as first received
    pub result: ScanResult,
    /// When the first notice arrived
    pub received_at: DateTime<Utc>,
    /// Inherited from the request
    pub expires_at: DateTime<Utc>,
}

impl CompletionRecord {
    /// Record a notice against its request.
    #[must_use]
    pub fn new(notice: CompletionNotice, request: &WorkRequest, received_at: DateTime<Utc>) -> Self {
        Self {
            request_id: notice.request_id,
            worker_identity: notice.worker_identity,
            result_summary: notice.result.summary(),
            result: notice.result,
            received_at,
            expires_at: request.expires_at,
        }
    }
}

/// A completion merged with its request's descriptive fields, ready to be
/// logged or forwarded to reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelatedCompletion {
    /// Request id
    pub request_id: RequestId,
    /// Reporting worker pool
    pub worker_identity: WorkerIdentity,
    /// Repository owner
    pub owner: String,
    /// Repository name
    pub repo: String,
    /// Head branch
    pub branch: String,
    /// Pull request number
    pub pr_id: u64,
    /// Head commit
    pub commit_sha: String,
    /// GitHub App installation
    pub install_id: Option<u64>,
    /// Trace id of the trigger
    pub trace_id: Option<String>,
    /// Check-run conclusion of `result`
    pub conclusion: CheckConclusion,
    /// The scan result
    pub result: ScanResult,
    /// When the notice arrived
    pub received_at: DateTime<Utc>,
}

impl CorrelatedCompletion {
    /// Merge a recorded completion with its request.
    #[must_use]
    pub fn merge(request: &WorkRequest, record: &CompletionRecord) -> Self {
        let payload = &request.payload;
        Self {
            request_id: record.request_id,
            worker_identity: record.worker_identity.clone(),
            owner: payload.owner.clone(),
            repo: payload.repo.clone(),
            branch: payload.branch.clone(),
            pr_id: payload.pr_id,
            commit_sha: payload.commit_sha.clone(),
            install_id: payload.install_id,
            trace_id: payload.trace_id.clone(),
            conclusion: record.result.conclusion(),
            result: record.result.clone(),
            received_at: record.received_at,
        }
    }
}

/// Result of correlating a completion notice.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionOutcome {
    /// First notice for the pair; recorded and merged
    Accepted(Box<CorrelatedCompletion>),
    /// A notice for the pair was already recorded; nothing changed
    Duplicate,
    /// The request expired or never existed
    UnknownRequest,
}

impl CompletionOutcome {
    /// Wire name of the outcome.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted(_) => "accepted",
            Self::Duplicate => "duplicate",
            Self::UnknownRequest => "unknown_request",
        }
    }
}

/// Errors that can occur during completion ledger operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompletionError {
    /// Backing storage unreachable or failed
    #[error("Completion ledger unavailable: {0}")]
    Unavailable(String),

    /// Stored record could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Deduplicating store of completion records.
pub trait CompletionLedger: Send + Sync {
    /// Insert the record unless one exists for its `(request_id,
    /// worker_identity)`. Returns whether it was inserted.
    ///
    /// The check and the insert are one atomic step.
    ///
    /// # Errors
    ///
    /// Returns [`CompletionError::Unavailable`] if the backend fails.
    fn record(
        &self,
        record: CompletionRecord,
    ) -> Pin<Box<dyn Future<Output = Result<bool, CompletionError>> + Send + '_>>;

    /// The stored record for a pair, if any.
    ///
    /// # Errors
    ///
    /// Returns [`CompletionError::Unavailable`] if the backend fails.
    fn get(
        &self,
        request_id: RequestId,
        worker: &WorkerIdentity,
    ) -> Pin<Box<dyn Future<Output = Result<Option<CompletionRecord>, CompletionError>> + Send + '_>>;

    /// All records for a request, ordered by worker identity.
    ///
    /// # Errors
    ///
    /// Returns [`CompletionError::Unavailable`] if the backend fails.
    fn list(
        &self,
        request_id: RequestId,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<CompletionRecord>, CompletionError>> + Send + '_>>;

    /// Remove records with `expires_at <= now`; returns how many.
    ///
    /// Backends with native expiry may return 0.
    ///
    /// # Errors
    ///
    /// Returns [`CompletionError::Unavailable`] if the backend fails.
    fn sweep(
        &self,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<usize, CompletionError>> + Send + '_>>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result(counts: &[(&str, u64)]) -> ScanResult {
        ScanResult {
            success: true,
            severity_counts: counts.iter().map(|(k, v)| ((*k).to_string(), *v)).collect(),
            ..ScanResult::default()
        }
    }

    #[test]
    fn conclusion_follows_worst_severity() {
        assert_eq!(result(&[]).conclusion(), CheckConclusion::Success);
        assert_eq!(result(&[("LOW", 4)]).conclusion(), CheckConclusion::Success);
        assert_eq!(result(&[("HIGH", 1), ("LOW", 4)]).conclusion(), CheckConclusion::Neutral);
        assert_eq!(result(&[("CRITICAL", 1)]).conclusion(), CheckConclusion::Failure);
        assert_eq!(ScanResult::failed("boom").conclusion(), CheckConclusion::Failure);
    }

    #[test]
    fn summary_lists_non_zero_severities() {
        let summary = result(&[("CRITICAL", 1), ("HIGH", 0), ("LOW", 2)]).summary();
        assert_eq!(summary, "3 issues (critical 1, low 2)");
        assert_eq!(result(&[]).summary(), "no issues");
        assert_eq!(ScanResult::failed("timeout").summary(), "scan failed: timeout");
    }

    #[test]
    fn legacy_result_fields_are_accepted() {
        let raw = json!({
            "success": true,
            "total_issues": 1,
            "severity_counters": {"HIGH": 1},
            "files_scanned": 12,
            "queries": [{"query_name": "Privileged Container", "severity": "HIGH", "line": 7}]
        });
        let parsed: ScanResult = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.count(Severity::High), 1);
        assert_eq!(parsed.findings[0].rule, "Privileged Container");
        assert_eq!(parsed.findings[0].line, Some(7));
        assert_eq!(parsed.extra["files_scanned"], json!(12));
    }

    #[test]
    fn notice_accepts_legacy_names() {
        let id = RequestId::generate();
        let raw = json!({"id": id.to_string(), "app_name": "kics-worker", "result": {"success": false}});
        let notice: CompletionNotice = serde_json::from_value(raw).unwrap();
        assert_eq!(notice.request_id, id);
        assert_eq!(notice.worker_identity.as_str(), "kics-worker");
    }

    #[test]
    fn outcome_wire_names() {
        assert_eq!(CompletionOutcome::Duplicate.as_str(), "duplicate");
        assert_eq!(CompletionOutcome::UnknownRequest.as_str(), "unknown_request");
    }
}
