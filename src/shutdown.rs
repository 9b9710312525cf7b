//! Cooperative cancellation.
//!
//! A single [`ShutdownCoordinator`] is shared by the CLI pipelines. Long
//! waits select against [`ShutdownCoordinator::wait_for_shutdown`], and the
//! failure-injection harness checks the flag between phases so an interrupt
//! still runs its rollback step.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Broadcasts a one-way shutdown flag to every interested task.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    watch_rx: watch::Receiver<bool>,
    watch_tx: Arc<watch::Sender<bool>>,
    triggered: Arc<AtomicBool>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (watch_tx, watch_rx) = watch::channel(false);
        Self {
            watch_rx,
            watch_tx: Arc::new(watch_tx),
            triggered: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Request shutdown. Idempotent.
    pub fn shutdown(&self) {
        if self
            .triggered
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!("Shutdown requested");
            let _ = self.watch_tx.send(true);
        }
    }

    /// Resolve when shutdown is requested (for use in `select!`).
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.watch_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Translates OS signals into a shutdown request.
pub struct SignalHandler {
    coordinator: ShutdownCoordinator,
}

impl SignalHandler {
    pub fn new(coordinator: ShutdownCoordinator) -> Self {
        Self { coordinator }
    }

    /// Wait for SIGTERM or SIGINT, then trigger shutdown.
    #[cfg(unix)]
    pub async fn run(self) {
        use tokio::signal::unix::{signal, SignalKind};

        let Ok(mut sigterm) = signal(SignalKind::terminate()) else {
            return;
        };
        let Ok(mut sigint) = signal(SignalKind::interrupt()) else {
            return;
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }

        self.coordinator.shutdown();
    }

    #[cfg(windows)]
    pub async fn run(self) {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C");
            self.coordinator.shutdown();
        }
    }
}
