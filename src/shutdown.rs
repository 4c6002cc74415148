//! Graceful shutdown and signal handling.
//!
//! Shutdown runs in phases:
//! - the process-wide signal fires, ending SSE streams and stopping the
//!   listeners from accepting new connections
//! - in-flight HTTP requests drain, bounded by the drain timeout
//! - every connector closes in parallel
//! - the result cache is cleared
//!
//! On Unix, `SIGHUP` re-reads the model file and reloads the gateway instead
//! of shutting down.

use crate::constants::DEFAULT_DRAIN_TIMEOUT;
use crate::server::Gateway;
use anyhow::anyhow;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Shutdown signal that can be awaited.
#[derive(Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Wait for the shutdown signal.
    pub async fn recv(&mut self) {
        let _ = self.receiver.wait_for(|&v| v).await;
    }

    /// Check if shutdown has been signaled without blocking.
    pub fn is_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }
}

/// Shutdown phases for coordinated cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    /// Shutdown has been initiated.
    Initiated,

    /// Waiting for in-flight HTTP requests.
    DrainingRequests,

    /// Closing every connector.
    ClosingConnectors,

    /// Dropping cached result sets.
    ClearingCache,

    /// Final cleanup complete.
    Complete,
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownPhase::Initiated => write!(f, "initiated"),
            ShutdownPhase::DrainingRequests => write!(f, "draining_requests"),
            ShutdownPhase::ClosingConnectors => write!(f, "closing_connectors"),
            ShutdownPhase::ClearingCache => write!(f, "clearing_cache"),
            ShutdownPhase::Complete => write!(f, "complete"),
        }
    }
}

/// Controller for managing graceful shutdown.
pub struct ShutdownController {
    sender: watch::Sender<bool>,
    shutting_down: AtomicBool,
    phase_sender: broadcast::Sender<ShutdownPhase>,
    drain_timeout: Duration,
}

impl ShutdownController {
    /// Create a new shutdown controller with the default drain timeout.
    pub fn new() -> Self {
        Self::with_drain_timeout(DEFAULT_DRAIN_TIMEOUT)
    }

    /// Create a shutdown controller with a custom drain timeout.
    pub fn with_drain_timeout(drain_timeout: Duration) -> Self {
        let (sender, _) = watch::channel(false);
        let (phase_sender, _) = broadcast::channel(16);

        Self {
            sender,
            shutting_down: AtomicBool::new(false),
            phase_sender,
            drain_timeout,
        }
    }

    /// Get a shutdown signal receiver.
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            receiver: self.sender.subscribe(),
        }
    }

    /// Subscribe to shutdown phase notifications.
    pub fn subscribe_phases(&self) -> broadcast::Receiver<ShutdownPhase> {
        self.phase_sender.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    /// Fire the process-wide shutdown signal. Idempotent.
    pub fn shutdown(&self) {
        if self
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!("Initiating graceful shutdown...");
            self.sender.send_replace(true);
            let _ = self.phase_sender.send(ShutdownPhase::Initiated);
        }
    }

    fn notify_phase(&self, phase: ShutdownPhase) {
        info!("Shutdown phase: {}", phase);
        let _ = self.phase_sender.send(phase);
    }

    /// Run the full shutdown sequence.
    ///
    /// `drain` completes when the listeners have finished their in-flight
    /// requests; it is abandoned once the drain timeout elapses.
    pub async fn graceful_shutdown<F>(&self, gateway: &Gateway, drain: F)
    where
        F: Future<Output = ()>,
    {
        self.shutdown();

        self.notify_phase(ShutdownPhase::DrainingRequests);
        if tokio::time::timeout(self.drain_timeout, drain).await.is_err() {
            warn!(
                "Drain timeout of {:?} exceeded with requests still running",
                self.drain_timeout
            );
        } else {
            info!("All requests drained");
        }

        self.notify_phase(ShutdownPhase::ClosingConnectors);
        if let Err(e) = gateway.runtime().connectors().close_all().await {
            error!("{}", e);
        }

        self.notify_phase(ShutdownPhase::ClearingCache);
        gateway.runtime().cache().clear().await;

        self.notify_phase(ShutdownPhase::Complete);
        info!("Graceful shutdown complete");
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared shutdown controller type.
pub type SharedShutdownController = Arc<ShutdownController>;

/// Create a shutdown controller with a custom drain timeout.
pub fn new_shutdown_controller(drain_timeout: Duration) -> SharedShutdownController {
    Arc::new(ShutdownController::with_drain_timeout(drain_timeout))
}

/// Wait until shutdown is signalled or `server` finishes first.
///
/// Returns `None` when shutdown was signalled and the server is still
/// draining. Otherwise the server has finished; a server that returns before
/// shutdown was requested is reported as an error.
pub async fn wait_for_exit(
    controller: &ShutdownController,
    server: &mut JoinHandle<anyhow::Result<()>>,
) -> Option<anyhow::Result<()>> {
    let mut signal = controller.signal();
    let result = tokio::select! {
        _ = signal.recv() => return None,
        result = server => result,
    };

    Some(match result {
        Ok(Ok(())) if controller.is_shutting_down() => Ok(()),
        Ok(Ok(())) => Err(anyhow!("server stopped unexpectedly")),
        Ok(Err(e)) => Err(e),
        Err(e) => Err(anyhow::Error::new(e).context("server task failed")),
    })
}

/// Install handlers that trigger shutdown on Ctrl+C and, on Unix, SIGTERM.
pub fn install_signal_handlers(controller: SharedShutdownController) {
    let ctrl_c_controller = Arc::clone(&controller);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, initiating shutdown...");
                ctrl_c_controller.shutdown();
            }
            Err(e) => {
                error!("Failed to listen for Ctrl+C signal: {}", e);
            }
        }
    });

    #[cfg(unix)]
    {
        tokio::spawn(async move {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM, initiating shutdown...");
                    controller.shutdown();
                }
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                }
            }
        });
    }
    #[cfg(not(unix))]
    drop(controller);
}

/// Reload the model from `model_path` on every SIGHUP until shutdown.
///
/// A model that fails to load or initialize leaves the running one in place.
#[cfg(unix)]
pub fn install_reload_handler(gateway: Gateway, model_path: PathBuf) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut sighup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to install SIGHUP handler: {}", e);
                return;
            }
        };
        let mut shutdown_signal = gateway.shutdown().signal();

        loop {
            tokio::select! {
                _ = shutdown_signal.recv() => break,
                received = sighup.recv() => {
                    if received.is_none() {
                        break;
                    }
                    info!("Received SIGHUP, reloading model from {}", model_path.display());
                    if let Err(e) = gateway.reload_from_path(&model_path).await {
                        error!("Reload failed, keeping current model: {}", e);
                    }
                }
            }
        }
    });
}

/// Reload on SIGHUP is only available on Unix.
#[cfg(not(unix))]
pub fn install_reload_handler(_gateway: Gateway, model_path: PathBuf) {
    warn!(
        "Model reload on SIGHUP is unavailable on this platform ({})",
        model_path.display()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_controller_creation() {
        let controller = ShutdownController::new();
        assert!(!controller.is_shutting_down());
        assert_eq!(controller.drain_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn test_shutdown_signal() {
        let controller = ShutdownController::new();
        let signal = controller.signal();
        assert!(!signal.is_shutdown());

        controller.shutdown();
        assert!(controller.is_shutting_down());
        assert!(signal.is_shutdown());
    }

    #[test]
    fn test_signal_wakes_on_shutdown() {
        let controller = ShutdownController::new();
        let mut signal = controller.signal();
        let mut recv = tokio_test::task::spawn(async move { signal.recv().await });

        tokio_test::assert_pending!(recv.poll());
        controller.shutdown();
        assert!(recv.is_woken());
        tokio_test::assert_ready!(recv.poll());
    }

    #[tokio::test]
    async fn test_signal_subscribed_after_shutdown_resolves() {
        let controller = ShutdownController::new();
        controller.shutdown();
        let mut late = controller.signal();
        tokio::time::timeout(Duration::from_millis(100), late.recv())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_idempotent() {
        let controller = ShutdownController::new();
        let mut phases = controller.subscribe_phases();

        controller.shutdown();
        controller.shutdown();

        assert_eq!(phases.recv().await.unwrap(), ShutdownPhase::Initiated);
        assert!(phases.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_wait_for_exit_reports_failed_server() {
        let controller = ShutdownController::new();
        let mut server = tokio::spawn(async { Err(anyhow!("listener lost")) });

        let exit = wait_for_exit(&controller, &mut server).await;

        let err = exit.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "listener lost");
    }

    #[tokio::test]
    async fn test_wait_for_exit_reports_early_return() {
        let controller = ShutdownController::new();
        let mut server = tokio::spawn(async { Ok(()) });

        let exit = wait_for_exit(&controller, &mut server).await;

        assert!(exit.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_wait_for_exit_returns_on_signal() {
        let controller = ShutdownController::new();
        let mut server = tokio::spawn(std::future::pending::<anyhow::Result<()>>());
        controller.shutdown();

        assert!(wait_for_exit(&controller, &mut server).await.is_none());
        server.abort();
    }

    #[test]
    fn test_shutdown_phase_display() {
        assert_eq!(ShutdownPhase::Initiated.to_string(), "initiated");
        assert_eq!(
            ShutdownPhase::DrainingRequests.to_string(),
            "draining_requests"
        );
        assert_eq!(
            ShutdownPhase::ClosingConnectors.to_string(),
            "closing_connectors"
        );
        assert_eq!(ShutdownPhase::ClearingCache.to_string(), "clearing_cache");
        assert_eq!(ShutdownPhase::Complete.to_string(), "complete");
    }
}
