//! Worker-side message handler.
//!
//! [`ScanHandler`] turns one delivery into one completion notice:
//!
//! 1. Resolve the request from the store
//! 2. Create a scratch [`Workspace`] (removed on every exit path)
//! 3. Run the [`Scanner`]
//! 4. Deliver the result through the [`CallbackNotifier`]
//!
//! A request that no longer exists is reported as a failed scan and the
//! message is acknowledged; redelivering it cannot help.

use crate::callback::{CallbackNotifier, NotifyError};
use crate::worker::{HandlerError, MessageHandler};
use prscan_core::{
    CompletionNotice, Delivery, RequestStore, RequestStoreError, ScanResult, WorkRequest,
    WorkerIdentity,
};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tempfile::TempDir;
use thiserror::Error;

/// Scanner failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    /// The scan ran and failed; reported to the coordinator as a failed result
    #[error("Scan failed: {0}")]
    Failed(String),

    /// Something outside the scan failed; the delivery is retried
    #[error("Transient scan error: {0}")]
    Transient(String),
}

/// Scratch directory for one scan.
///
/// Deleted when dropped.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    /// Create a fresh directory under `root` (or the system temp dir).
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the directory cannot be created.
    pub fn create(root: Option<&Path>) -> std::io::Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("prscan-");
        let dir = match root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        Ok(Self { dir })
    }

    /// Directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// Runs a scan.
pub trait Scanner: Send + Sync {
    /// Scan `request`, using `workspace` for any files.
    ///
    /// # Errors
    ///
    /// [`ScanError::Failed`] becomes a failed [`ScanResult`];
    /// [`ScanError::Transient`] leaves the message pending.
    fn scan<'a>(
        &'a self,
        request: &'a WorkRequest,
        workspace: &'a Workspace,
    ) -> Pin<Box<dyn Future<Output = Result<ScanResult, ScanError>> + Send + 'a>>;
}

/// Message handler that scans and reports back.
pub struct ScanHandler {
    store: Arc<dyn RequestStore>,
    scanner: Arc<dyn Scanner>,
    notifier: Arc<dyn CallbackNotifier>,
    identity: WorkerIdentity,
    workspace_root: Option<PathBuf>,
}

impl ScanHandler {
    /// Create a handler reporting as `identity`.
    #[must_use]
    pub fn new(
        store: Arc<dyn RequestStore>,
        scanner: Arc<dyn Scanner>,
        notifier: Arc<dyn CallbackNotifier>,
        identity: impl Into<WorkerIdentity>,
    ) -> Self {
        Self {
            store,
            scanner,
            notifier,
            identity: identity.into(),
            workspace_root: None,
        }
    }

    /// Create workspaces under `root`.
    #[must_use]
    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = Some(root.into());
        self
    }

    async fn scan(&self, request: &WorkRequest) -> Result<ScanResult, HandlerError> {
        let workspace = Workspace::create(self.workspace_root.as_deref())
            .map_err(|e| HandlerError::failed(format!("workspace: {e}")))?;
        tracing::debug!(
            request_id = %request.id,
            workspace = %workspace.path().display(),
            "Scanning {}",
            request.payload.slug()
        );

        match self.scanner.scan(request, &workspace).await {
            Ok(result) => Ok(result),
            Err(ScanError::Failed(message)) => {
                tracing::warn!(request_id = %request.id, error = %message, "Scan failed");
                Ok(ScanResult::failed(message))
            }
            Err(ScanError::Transient(message)) => Err(HandlerError::Failed(message)),
        }
    }

    async fn report(&self, delivery: &Delivery, result: ScanResult) -> Result<(), HandlerError> {
        let notice = CompletionNotice {
            request_id: delivery.message.request_id,
            worker_identity: self.identity.clone(),
            result,
        };
        match self
            .notifier
            .notify(&delivery.message.callback_address, &notice)
            .await
        {
            Ok(()) => Ok(()),
            Err(NotifyError::NoAddress) => {
                // Nowhere to report, and redelivery will not add an address.
                tracing::error!(
                    request_id = %notice.request_id,
                    "No callback address, completion not delivered"
                );
                Ok(())
            }
            Err(e) => Err(HandlerError::failed(e)),
        }
    }
}

impl MessageHandler for ScanHandler {
    fn handle<'a>(
        &'a self,
        delivery: &'a Delivery,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>> {
        Box::pin(async move {
            let request_id = delivery.message.request_id;
            let result = match self.store.get(request_id).await {
                Ok(request) => self.scan(&request).await?,
                Err(RequestStoreError::NotFound(_)) => {
                    tracing::warn!(%request_id, "Request not found, reporting failed scan");
                    ScanResult::failed("No storage data found")
                }
                Err(e) => return Err(HandlerError::failed(e)),
            };
            self.report(delivery, result).await
        })
    }
}
