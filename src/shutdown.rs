//! Process-wide shutdown signal.
//!
//! A [`ShutdownController`] wraps a cancellation token that is set once and
//! never reset. Every suspension point in the engine (permit waits, backoff
//! sleeps, slice collection) observes it. The OS signal listener only
//! cancels the token; draining is the orchestrator's job.

use log::{info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Cloneable handle to the process-wide cancellation signal.
#[derive(Debug, Clone, Default)]
pub struct ShutdownController {
    token: CancellationToken,
}

impl ShutdownController {
    /// Create a new, untriggered controller.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Request shutdown. Idempotent.
    pub fn trigger(&self) {
        if !self.token.is_cancelled() {
            info!("Shutdown requested, draining");
        }
        self.token.cancel();
    }

    /// Check whether shutdown has been requested.
    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait until shutdown is requested.
    pub async fn triggered(&self) {
        self.token.cancelled().await
    }

    /// Borrow the underlying token for `select!` at suspension points.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Spawn a task that triggers shutdown on SIGINT or SIGTERM.
    pub fn listen_for_signals(&self) -> JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move {
            wait_for_signal(&controller).await;
            controller.trigger();
        })
    }
}

#[cfg(unix)]
async fn wait_for_signal(controller: &ShutdownController) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                _ = controller.triggered() => {}
            }
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
        _ = term.recv() => info!("Received SIGTERM"),
        _ = controller.triggered() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal(controller: &ShutdownController) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C"),
        _ = controller.triggered() => {}
    }
}
