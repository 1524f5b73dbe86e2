//! # prscan runtime
//!
//! The moving parts of the fan-out coordinator, written against the storage
//! traits of `prscan-core`.
//!
//! ## Core Components
//!
//! - **Dispatcher**: stores a request and appends one envelope per target stream
//! - **Worker Loop**: reclaim, read, handle, ack; contains poison messages
//! - **Callback Correlator**: joins completions to requests, once per worker
//! - **Retention Sweeper**: removes expired requests and completions
//! - **Scan Handler**: worker-side glue from a delivery to a completion notice
//!
//! ## Example
//!
//! ```rust,no_run
//! use prscan_runtime::dispatcher::{Dispatcher, DispatcherConfig};
//! use prscan_core::{RequestPayload, RequestStore, StreamLog, StreamName};
//! use std::sync::Arc;
//!
//! # async fn example(
//! #     store: Arc<dyn RequestStore>,
//! #     log: Arc<dyn StreamLog>,
//! #     payload: RequestPayload,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let dispatcher = Dispatcher::new(store, log, DispatcherConfig::new("http://coordinator:8000/callbacks"));
//! let receipt = dispatcher
//!     .dispatch(payload, &[StreamName::new("worker-kics"), StreamName::new("worker-blackduck")])
//!     .await?;
//! println!("dispatched {}", receipt.request_id);
//! # Ok(())
//! # }
//! ```

use prscan_core::{DeadLetterSink, RequestStore, StreamLog};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Retry logic with exponential backoff
pub mod retry;

/// Prometheus metrics for observability
pub mod metrics;

/// Request storage and fan-out
pub mod dispatcher;

/// Stream consumer loop with reclaim and poison containment
pub mod worker;

/// Completion correlation
pub mod correlator;

/// Expiry sweep
pub mod sweeper;

/// Completion delivery (HTTP or in-process)
pub mod callback;

/// Delivery handler that scans and reports back
pub mod handler;

/// Dead-letter replay and discard
pub mod replay;

pub use callback::{CallbackNotifier, DirectNotifier, HttpCallbackNotifier, NotifyError};
pub use correlator::{CallbackCorrelator, CorrelatorError};
pub use dispatcher::{DispatchError, DispatchReceipt, Dispatcher, DispatcherConfig};
pub use handler::{ScanError, ScanHandler, Scanner, Workspace};
pub use replay::{DeadLetterReplayer, ReplayError};
pub use retry::{Backoff, RetryPolicy};
pub use sweeper::{RetentionSweeper, SweepReport};
pub use worker::{
    HandlerError, IterationReport, MessageHandler, PoisonPolicy, PollConfig, Subscription,
    WorkerLoop, WorkerPhase,
};

/// Health check status levels
///
/// Indicates the current health state of a component or system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Component is fully operational
    Healthy,

    /// Component is operational but needs attention (e.g., dead letters waiting)
    Degraded,

    /// Component is not operational
    Unhealthy,
}

impl HealthStatus {
    /// Check if status is healthy
    #[must_use]
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// Check if status is degraded
    #[must_use]
    pub const fn is_degraded(self) -> bool {
        matches!(self, Self::Degraded)
    }

    /// Check if status is unhealthy
    #[must_use]
    pub const fn is_unhealthy(self) -> bool {
        matches!(self, Self::Unhealthy)
    }

    /// Get the worst status between two statuses
    #[must_use]
    pub const fn worst(self, other: Self) -> Self {
        match (self, other) {
            (Self::Unhealthy, _) | (_, Self::Unhealthy) => Self::Unhealthy,
            (Self::Degraded, _) | (_, Self::Degraded) => Self::Degraded,
            _ => Self::Healthy,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Health check result for a component
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    /// Name of the component being checked
    pub component: String,

    /// Current health status
    pub status: HealthStatus,

    /// Optional message providing details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Optional metadata (e.g., counts)
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl HealthCheck {
    /// Create a healthy check result
    #[must_use]
    pub fn healthy(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Healthy,
            message: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Create a degraded check result
    #[must_use]
    pub fn degraded(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Degraded,
            message: Some(message.into()),
            metadata: BTreeMap::new(),
        }
    }

    /// Create an unhealthy check result
    #[must_use]
    pub fn unhealthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
            metadata: BTreeMap::new(),
        }
    }

    /// Add metadata to the health check
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Aggregated health report
///
/// Combines multiple health checks into an overall system status.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Overall system status (worst of all checks)
    pub status: HealthStatus,

    /// Individual component checks
    pub checks: Vec<HealthCheck>,

    /// Timestamp when report was generated
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl HealthReport {
    /// Create a new health report from checks
    #[must_use]
    pub fn new(checks: Vec<HealthCheck>) -> Self {
        let status = checks
            .iter()
            .map(|c| c.status)
            .fold(HealthStatus::Healthy, HealthStatus::worst);

        Self {
            status,
            checks,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Check if overall system is healthy
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        self.status.is_healthy()
    }

    /// Check if overall system is degraded
    #[must_use]
    pub const fn is_degraded(&self) -> bool {
        self.status.is_degraded()
    }

    /// Check if overall system is unhealthy
    #[must_use]
    pub const fn is_unhealthy(&self) -> bool {
        self.status.is_unhealthy()
    }

    /// The check for `component`, if present.
    #[must_use]
    pub fn check(&self, component: &str) -> Option<&HealthCheck> {
        self.checks.iter().find(|c| c.component == component)
    }
}

/// Probe the backends.
///
/// The request store and stream log are unhealthy when unreachable. Pending
/// dead letters make the report degraded: the system works but an operator
/// has something to look at.
pub async fn probe(
    store: &Arc<dyn RequestStore>,
    log: &Arc<dyn StreamLog>,
    dead_letters: Option<&Arc<dyn DeadLetterSink>>,
) -> HealthReport {
    let mut checks = Vec::with_capacity(3);

    checks.push(match store.ping().await {
        Ok(()) => HealthCheck::healthy("request_store"),
        Err(e) => HealthCheck::unhealthy("request_store", e.to_string()),
    });
    checks.push(match log.ping().await {
        Ok(()) => HealthCheck::healthy("stream_log"),
        Err(e) => HealthCheck::unhealthy("stream_log", e.to_string()),
    });

    if let Some(sink) = dead_letters {
        checks.push(match sink.count_pending().await {
            Ok(0) => HealthCheck::healthy("dead_letters").with_metadata("pending", "0"),
            Ok(n) => HealthCheck::degraded("dead_letters", format!("{n} dead letters pending"))
                .with_metadata("pending", n.to_string()),
            Err(e) => HealthCheck::unhealthy("dead_letters", e.to_string()),
        });
    }

    let report = HealthReport::new(checks);
    if !report.is_healthy() {
        tracing::warn!(status = %report.status, "Health probe not healthy");
    }
    report
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use prscan_core::{Burial, Clock, EntryId, GroupName, RequestId, StreamMessage, StreamName};
    use prscan_testing::{
        InMemoryDeadLetterSink, InMemoryRequestStore, InMemoryStreamLog, test_clock,
    };

    #[test]
    fn worst_status_wins() {
        assert_eq!(HealthStatus::Healthy.worst(HealthStatus::Degraded), HealthStatus::Degraded);
        assert_eq!(HealthStatus::Unhealthy.worst(HealthStatus::Degraded), HealthStatus::Unhealthy);
        assert_eq!(HealthReport::new(Vec::new()).status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn probe_reports_each_backend() {
        let store_impl = InMemoryRequestStore::new();
        let sink_impl = InMemoryDeadLetterSink::new();
        let store: Arc<dyn RequestStore> = Arc::new(store_impl.clone());
        let log: Arc<dyn StreamLog> = Arc::new(InMemoryStreamLog::new());
        let sink: Arc<dyn DeadLetterSink> = Arc::new(sink_impl.clone());

        let report = probe(&store, &log, Some(&sink)).await;
        assert!(report.is_healthy());
        assert_eq!(report.checks.len(), 3);

        sink_impl
            .bury(Burial {
                stream: StreamName::new("worker-kics"),
                entry_id: EntryId::new(1, 0),
                group: GroupName::workers(),
                message: StreamMessage::new(RequestId::generate(), ""),
                delivery_count: 5,
                dead_lettered_at: test_clock().now(),
            })
            .await
            .unwrap();
        let report = probe(&store, &log, Some(&sink)).await;
        assert!(report.is_degraded());
        assert_eq!(report.check("dead_letters").unwrap().metadata["pending"], "1");

        store_impl.set_unavailable(true);
        let report = probe(&store, &log, None).await;
        assert!(report.is_unhealthy());
        assert_eq!(report.check("request_store").unwrap().status, HealthStatus::Unhealthy);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "unhealthy");
    }
}
