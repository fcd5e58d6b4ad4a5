//! Graceful shutdown for blockfs processes.
//!
//! One [`ShutdownCoordinator`] per process fans the stop signal out to the Raft
//! node, the heartbeat and sync-read loops and every HTTP server. Components that
//! need explicit teardown register a [`ServiceHandle`] with the [`ShutdownManager`].

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{error, info};

/// Maximum time to wait for graceful shutdown before force exit.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Shutdown coordinator for managing graceful service termination.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    /// Broadcast channel for background loops and servers.
    shutdown_tx: broadcast::Sender<()>,
    /// Latched flag for late waiters.
    shutdown_watch: watch::Receiver<bool>,
    shutdown_watch_tx: Arc<watch::Sender<bool>>,
    is_shutting_down: Arc<AtomicBool>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_SHUTDOWN_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (shutdown_watch_tx, shutdown_watch) = watch::channel(false);

        Self {
            shutdown_tx,
            shutdown_watch,
            shutdown_watch_tx: Arc::new(shutdown_watch_tx),
            is_shutting_down: Arc::new(AtomicBool::new(false)),
            timeout,
        }
    }

    /// Receiver that yields once shutdown starts.
    ///
    /// Subscribe before calling [`shutdown`](Self::shutdown); a receiver created
    /// afterwards never sees the signal. Use [`wait_for_shutdown`](Self::wait_for_shutdown)
    /// for late waiters.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    /// Initiate shutdown. Later calls do nothing.
    pub fn shutdown(&self) {
        if self
            .is_shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!("Initiating graceful shutdown");
            let _ = self.shutdown_watch_tx.send(true);
            let _ = self.shutdown_tx.send(());
        }
    }

    /// Resolve once shutdown has started, even if it started earlier.
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.shutdown_watch.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Turns SIGINT/SIGTERM into a coordinated shutdown.
pub struct SignalHandler {
    coordinator: ShutdownCoordinator,
}

impl SignalHandler {
    pub fn new(coordinator: ShutdownCoordinator) -> Self {
        Self { coordinator }
    }

    /// Returns after the first signal, having started shutdown.
    #[cfg(unix)]
    pub async fn run(self) {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(e), _) | (_, Err(e)) => {
                error!(error = %e, "Failed to install signal handlers");
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }

        self.coordinator.shutdown();
    }

    #[cfg(not(unix))]
    pub async fn run(self) {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C");
                self.coordinator.shutdown();
            }
            Err(e) => error!(error = %e, "Failed to install Ctrl+C handler"),
        }
    }
}

/// A running component and the future that stops it.
pub struct ServiceHandle {
    name: String,
    shutdown_fn: Option<Pin<Box<dyn Future<Output = ()> + Send>>>,
}

impl ServiceHandle {
    pub fn new<S, F>(name: S, shutdown_fn: F) -> Self
    where
        S: Into<String>,
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            name: name.into(),
            shutdown_fn: Some(Box::pin(shutdown_fn)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn shutdown(&mut self) {
        if let Some(shutdown_fn) = self.shutdown_fn.take() {
            info!(service = %self.name, "Shutting down service");
            shutdown_fn.await;
        }
    }
}

/// Stops registered services in reverse order once shutdown starts.
pub struct ShutdownManager {
    coordinator: ShutdownCoordinator,
    services: Vec<ServiceHandle>,
}

impl ShutdownManager {
    pub fn new(coordinator: ShutdownCoordinator) -> Self {
        Self {
            coordinator,
            services: Vec::new(),
        }
    }

    pub fn register(&mut self, handle: ServiceHandle) {
        info!(service = %handle.name(), "Registered service for managed shutdown");
        self.services.push(handle);
    }

    pub async fn run(mut self) {
        self.coordinator.wait_for_shutdown().await;
        info!(services = self.services.len(), "Stopping services");

        let timeout = self.coordinator.timeout();
        let shutdown_future = async {
            while let Some(mut service) = self.services.pop() {
                service.shutdown().await;
            }
        };

        if tokio::time::timeout(timeout, shutdown_future).await.is_err() {
            error!(?timeout, "Shutdown timed out");
        } else {
            info!("All services shut down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let coordinator = ShutdownCoordinator::new();
        let mut rx = coordinator.subscribe();
        assert!(!coordinator.is_shutting_down());

        coordinator.shutdown();
        coordinator.shutdown();
        assert!(coordinator.is_shutting_down());

        let result = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(result.is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_late_waiter_sees_shutdown() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.shutdown();

        let waited =
            tokio::time::timeout(Duration::from_millis(100), coordinator.wait_for_shutdown()).await;
        assert!(waited.is_ok());
    }

    #[tokio::test]
    async fn test_manager_stops_services_in_reverse() {
        let coordinator = ShutdownCoordinator::new();
        let mut manager = ShutdownManager::new(coordinator.clone());
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let stopped = Arc::new(AtomicUsize::new(0));

        for name in ["metadata", "metrics"] {
            let order = Arc::clone(&order);
            let stopped = Arc::clone(&stopped);
            manager.register(ServiceHandle::new(name, async move {
                order.lock().push(name);
                stopped.fetch_add(1, Ordering::SeqCst);
            }));
        }

        coordinator.shutdown();
        let result = tokio::time::timeout(Duration::from_millis(100), manager.run()).await;
        assert!(result.is_ok());
        assert_eq!(stopped.load(Ordering::SeqCst), 2);
        assert_eq!(*order.lock(), vec!["metrics", "metadata"]);
    }
}
