//! Completion delivery from workers back to the coordinator.
//!
//! Workers report through a [`CallbackNotifier`]. In a split deployment that
//! is [`HttpCallbackNotifier`], posting to the envelope's callback address;
//! in a single process it can be [`DirectNotifier`], which hands the notice
//! straight to a [`CallbackCorrelator`].

use crate::correlator::CallbackCorrelator;
use crate::retry::{RetryPolicy, retry_with_predicate};
use prscan_core::{CompletionNotice, CompletionOutcome};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors delivering a completion notice.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotifyError {
    /// Connection failed or timed out
    #[error("Callback transport error: {0}")]
    Transport(String),

    /// The coordinator answered with a non-success status
    #[error("Callback rejected with status {status}: {body}")]
    Rejected {
        /// HTTP status code
        status: u16,
        /// Response body (truncated)
        body: String,
    },

    /// Neither the envelope nor the notifier had a callback address
    #[error("No callback address")]
    NoAddress,

    /// In-process correlation failed
    #[error("Correlation failed: {0}")]
    Correlation(String),
}

impl NotifyError {
    /// Whether retrying may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Correlation(_) => true,
            Self::Rejected { status, .. } => *status >= 500 || *status == 429,
            Self::NoAddress => false,
        }
    }
}

/// Sends a completion notice to the coordinator.
pub trait CallbackNotifier: Send + Sync {
    /// Deliver `notice` to `address`.
    ///
    /// An empty `address` means "use the notifier's default", if it has one.
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError`] once delivery has definitely failed.
    fn notify<'a>(
        &'a self,
        address: &'a str,
        notice: &'a CompletionNotice,
    ) -> Pin<Box<dyn Future<Output = Result<(), NotifyError>> + Send + 'a>>;
}

const MAX_ERROR_BODY: usize = 512;

/// Posts notices as JSON, retrying transport errors and 5xx responses.
#[derive(Debug, Clone)]
pub struct HttpCallbackNotifier {
    client: reqwest::Client,
    retry: RetryPolicy,
    default_address: Option<String>,
}

impl HttpCallbackNotifier {
    /// Create a notifier with a 30 second request timeout and the default
    /// retry policy.
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError::Transport`] if the HTTP client cannot be built.
    pub fn new() -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        Ok(Self::with_client(client))
    }

    /// Use an existing client.
    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            retry: RetryPolicy::default(),
            default_address: None,
        }
    }

    /// Set the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Address used when an envelope carries none.
    #[must_use]
    pub fn with_default_address(mut self, address: impl Into<String>) -> Self {
        self.default_address = Some(address.into()).filter(|a| !a.is_empty());
        self
    }

    fn resolve<'a>(&'a self, address: &'a str) -> Result<&'a str, NotifyError> {
        if !address.is_empty() {
            return Ok(address);
        }
        self.default_address.as_deref().ok_or(NotifyError::NoAddress)
    }

    async fn post(&self, address: &str, notice: &CompletionNotice) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(address)
            .json(notice)
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        Err(NotifyError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

impl CallbackNotifier for HttpCallbackNotifier {
    fn notify<'a>(
        &'a self,
        address: &'a str,
        notice: &'a CompletionNotice,
    ) -> Pin<Box<dyn Future<Output = Result<(), NotifyError>> + Send + 'a>> {
        Box::pin(async move {
            let address = self.resolve(address)?;
            retry_with_predicate(
                self.retry.clone(),
                || self.post(address, notice),
                NotifyError::is_transient,
            )
            .await?;
            tracing::debug!(
                request_id = %notice.request_id,
                worker = %notice.worker_identity,
                address,
                "Completion delivered"
            );
            Ok(())
        })
    }
}

/// Correlates notices in-process, ignoring the address.
#[derive(Clone)]
pub struct DirectNotifier {
    correlator: Arc<CallbackCorrelator>,
}

impl DirectNotifier {
    /// Deliver to `correlator`.
    #[must_use]
    pub const fn new(correlator: Arc<CallbackCorrelator>) -> Self {
        Self { correlator }
    }
}

impl CallbackNotifier for DirectNotifier {
    fn notify<'a>(
        &'a self,
        _address: &'a str,
        notice: &'a CompletionNotice,
    ) -> Pin<Box<dyn Future<Output = Result<(), NotifyError>> + Send + 'a>> {
        Box::pin(async move {
            let outcome = self
                .correlator
                .complete_notice(notice.clone())
                .await
                .map_err(|e| NotifyError::Correlation(e.to_string()))?;
            if matches!(outcome, CompletionOutcome::UnknownRequest) {
                tracing::warn!(request_id = %notice.request_id, "Completion for unknown request");
            }
            Ok(())
        })
    }
}
