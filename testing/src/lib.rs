//! # prscan testing
//!
//! Testing utilities for prscan.
//!
//! This crate provides:
//! - Deterministic clocks ([`FixedClock`], [`ManualClock`])
//! - In-memory implementations of every storage seam, with failure injection
//! - Payload builders and proptest strategies
//!
//! ## Example
//!
//! ```ignore
//! use prscan_testing::{InMemoryRequestStore, InMemoryStreamLog, helpers::sample_payload};
//!
//! #[tokio::test]
//! async fn dispatch_reaches_both_streams() {
//!     let store = Arc::new(InMemoryRequestStore::new());
//!     let log = Arc::new(InMemoryStreamLog::new());
//!     let dispatcher = Dispatcher::new(store, log.clone(), DispatcherConfig::default());
//!
//!     let receipt = dispatcher.dispatch(sample_payload(), &streams).await?;
//!     assert_eq!(log.len(&streams[0]), 1);
//! }
//! ```

use chrono::{DateTime, Utc};
use prscan_core::environment::Clock;

mod memory_stores;
mod memory_stream_log;

pub use memory_stores::{InMemoryCompletionLedger, InMemoryDeadLetterSink, InMemoryRequestStore};
pub use memory_stream_log::InMemoryStreamLog;

/// Mock implementations of environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, RwLock};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use prscan_testing::mocks::FixedClock;
    /// use prscan_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to.
    ///
    /// Clones share the same time, so a test can hand one copy to a backend
    /// and advance it from the outside to cross idle or expiry thresholds.
    ///
    /// ```
    /// use prscan_testing::mocks::ManualClock;
    /// use prscan_core::environment::Clock;
    /// use std::time::Duration;
    ///
    /// let clock = ManualClock::starting_at(prscan_testing::test_clock().now());
    /// let handle = clock.clone();
    /// let before = clock.now();
    /// handle.advance(Duration::from_secs(61));
    /// assert_eq!((clock.now() - before).num_seconds(), 61);
    /// ```
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<RwLock<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Create a clock reading `time`.
        #[must_use]
        pub fn starting_at(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(RwLock::new(time)),
            }
        }

        /// Move the clock forward.
        ///
        /// # Panics
        ///
        /// Panics if the lock is poisoned or the step overflows `chrono`.
        #[allow(clippy::unwrap_used, clippy::expect_used)]
        pub fn advance(&self, by: std::time::Duration) {
            let step = chrono::Duration::from_std(by).expect("step fits in chrono::Duration");
            *self.time.write().unwrap() += step;
        }

        /// Set the clock to an absolute time.
        ///
        /// # Panics
        ///
        /// Panics if the lock is poisoned.
        #[allow(clippy::unwrap_used)]
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.write().unwrap() = time;
        }
    }

    impl Default for ManualClock {
        fn default() -> Self {
            Self::starting_at(test_clock().now())
        }
    }

    impl Clock for ManualClock {
        #[allow(clippy::unwrap_used)]
        fn now(&self) -> DateTime<Utc> {
            *self.time.read().unwrap()
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Test helpers and builders.
pub mod helpers {
    use prscan_core::{RequestPayload, StreamName};

    /// A payload for `octocat/hello-world#42`.
    #[must_use]
    pub fn sample_payload() -> RequestPayload {
        payload_for("octocat", "hello-world", 42)
    }

    /// A payload for an arbitrary repository and pull request.
    #[must_use]
    pub fn payload_for(owner: &str, repo: &str, pr_id: u64) -> RequestPayload {
        RequestPayload {
            owner: owner.to_string(),
            repo: repo.to_string(),
            branch: "feature-branch".to_string(),
            pr_id,
            commit_sha: "0123456789abcdef0123456789abcdef01234567".to_string(),
            install_id: Some(1001),
            trace_id: Some(format!("trace-{pr_id}")),
            extra: serde_json::Map::new(),
        }
    }

    /// Stream names from string literals.
    #[must_use]
    pub fn streams(names: &[&str]) -> Vec<StreamName> {
        names.iter().copied().map(StreamName::new).collect()
    }

    /// Install a test-writer subscriber so `tracing` output shows up for
    /// failing tests. Safe to call more than once.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "prscan=debug".into()),
            )
            .with_test_writer()
            .try_init();
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use prscan_core::RequestPayload;
    use proptest::prelude::*;

    /// Arbitrary request payloads, including pass-through extra fields.
    pub fn payload() -> impl Strategy<Value = RequestPayload> {
        (
            "[a-z][a-z0-9-]{0,15}",
            "[a-z][a-z0-9._-]{0,20}",
            "[a-z][a-z0-9/_-]{0,20}",
            any::<u64>(),
            "[0-9a-f]{40}",
            proptest::option::of(any::<u64>()),
            proptest::option::of("[a-z0-9-]{1,16}"),
            proptest::collection::btree_map("x_[a-z]{1,8}", any::<i64>(), 0..4),
        )
            .prop_map(
                |(owner, repo, branch, pr_id, commit_sha, install_id, trace_id, extra)| {
                    RequestPayload {
                        owner,
                        repo,
                        branch,
                        pr_id,
                        commit_sha,
                        install_id,
                        trace_id,
                        extra: extra
                            .into_iter()
                            .map(|(k, v)| (k, serde_json::Value::from(v)))
                            .collect(),
                    }
                },
            )
    }
}

// Re-export commonly used items
pub use mocks::{FixedClock, ManualClock, test_clock};

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        let time1 = clock.now();
        let time2 = clock.now();
        assert_eq!(time1, time2);
    }

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::default();
        let other = clock.clone();
        other.advance(Duration::from_secs(5));
        assert_eq!(clock.now(), other.now());
        assert_eq!((clock.now() - test_clock().now()).num_seconds(), 5);
    }
}
