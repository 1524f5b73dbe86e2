//! Process lifecycle: tracing setup, shutdown signals and draining
//! background tasks.
//!
//! # Graceful Shutdown
//!
//! When a shutdown signal is received (Ctrl+C or SIGTERM):
//! 1. The HTTP server stops accepting new connections
//! 2. `true` is sent on the shutdown channel
//! 3. Background tasks get a bounded time to finish their current work
//! 4. Clean exit

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "info,prscan_server=debug,sqlx=warn";

/// Install the global `fmt` subscriber, filtered by `RUST_LOG`.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// If a handler cannot be installed the other one is still awaited; if
/// neither can, this never returns and the process must be killed.
pub async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        () = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}

/// Resolve once `rx` reads `true` or its sender is dropped.
pub async fn stopped(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            break;
        }
    }
}

/// Shutdown broadcast for background loops.
///
/// Loops hold a [`watch::Receiver`] and stop once it reads `true`.
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Shutdown {
    /// Create a broadcaster with no tasks.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            tx,
            tasks: Vec::new(),
        }
    }

    /// A receiver for a new background loop.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Track a spawned task so [`Shutdown::drain`] waits for it.
    pub fn track(&mut self, name: &'static str, handle: JoinHandle<()>) {
        self.tasks.push((name, handle));
    }

    /// Number of tracked tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether no task is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Signal every loop and wait up to `timeout` for each tracked task.
    ///
    /// Returns how many tasks stopped cleanly. Tasks that time out are
    /// aborted.
    pub async fn drain(self, timeout: Duration) -> usize {
        let _ = self.tx.send(true);
        let mut clean = 0;
        for (name, mut handle) in self.tasks {
            match tokio::time::timeout(timeout, &mut handle).await {
                Ok(Ok(())) => {
                    clean += 1;
                    info!(task = name, "Task stopped gracefully");
                }
                Ok(Err(e)) => warn!(task = name, error = %e, "Task failed"),
                Err(_) => {
                    handle.abort();
                    warn!(task = name, "Task shutdown timed out");
                }
            }
        }
        clean
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drain_signals_and_waits() {
        let mut shutdown = Shutdown::new();
        let rx = shutdown.subscribe();
        shutdown.track("loop", tokio::spawn(stopped(rx)));
        assert_eq!(shutdown.len(), 1);
        assert_eq!(shutdown.drain(Duration::from_secs(1)).await, 1);
    }

    #[test]
    fn stopped_waits_for_true() {
        let (tx, rx) = watch::channel(false);
        let mut task = tokio_test::task::spawn(stopped(rx));
        tokio_test::assert_pending!(task.poll());

        tx.send(false).unwrap();
        tokio_test::assert_pending!(task.poll());

        tx.send(true).unwrap();
        tokio_test::assert_ready!(task.poll());
    }

    #[test]
    fn stopped_resolves_when_the_sender_is_gone() {
        let (tx, rx) = watch::channel(false);
        let mut task = tokio_test::task::spawn(stopped(rx));
        tokio_test::assert_pending!(task.poll());
        drop(tx);
        tokio_test::assert_ready!(task.poll());
    }

    #[tokio::test]
    async fn stuck_tasks_are_aborted() {
        let mut shutdown = Shutdown::new();
        shutdown.track("stuck", tokio::spawn(std::future::pending::<()>()));
        assert_eq!(shutdown.drain(Duration::from_millis(20)).await, 0);
    }

    #[tokio::test]
    async fn empty_drain_is_immediate() {
        let shutdown = Shutdown::default();
        assert!(shutdown.is_empty());
        assert_eq!(shutdown.drain(Duration::from_millis(1)).await, 0);
    }
}
