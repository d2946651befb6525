//! Graceful shutdown.
//!
//! One broadcast channel fans the signal out to every loop. Loops stop between
//! ticks / fetches; work already in flight finishes first.
//!
//! ```rust,no_run
//! use outbox_runtime::shutdown::{Shutdown, shutdown_signal};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let shutdown = Shutdown::new();
//! let mut rx = shutdown.subscribe();
//! let task = tokio::spawn(async move {
//!     let _ = rx.recv().await;
//! });
//!
//! shutdown_signal().await;
//! shutdown.trigger();
//! Shutdown::join("worker", task, Duration::from_secs(10)).await;
//! # }
//! ```

use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Shutdown broadcaster.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: broadcast::Sender<()>,
}

impl Shutdown {
    /// Create a broadcaster with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    /// A receiver for one loop.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Tell every subscriber to stop.
    pub fn trigger(&self) {
        let receivers = self.tx.send(()).unwrap_or(0);
        info!(receivers, "Shutdown signal broadcast");
    }

    /// Wait for a task to finish, giving up after `timeout`.
    pub async fn join(name: &str, handle: JoinHandle<()>, timeout: Duration) {
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(())) => info!(task = name, "Task stopped gracefully"),
            Ok(Err(e)) => warn!(task = name, error = %e, "Task failed"),
            Err(_) => warn!(task = name, "Task shutdown timed out"),
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for Ctrl+C or SIGTERM.
///
/// If a handler cannot be installed, that source is ignored and the other one
/// still works.
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
            Ok(mut stream) => {
                stream.recv().await;
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_reaches_every_subscriber() {
        let shutdown = Shutdown::new();
        let mut first = shutdown.subscribe();
        let mut second = shutdown.subscribe();

        shutdown.trigger();

        assert!(first.recv().await.is_ok());
        assert!(second.recv().await.is_ok());
    }

    #[tokio::test]
    async fn trigger_without_subscribers_is_harmless() {
        Shutdown::new().trigger();
    }

    #[tokio::test]
    async fn join_gives_up_on_stuck_tasks() {
        let stuck = tokio::spawn(std::future::pending::<()>());
        Shutdown::join("stuck", stuck, Duration::from_millis(10)).await;
    }
}
