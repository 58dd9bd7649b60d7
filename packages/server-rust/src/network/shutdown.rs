//! Server lifecycle state and open-connection tracking for shutdown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;

/// Lifecycle of the RPC server: Starting -> Ready -> Draining -> Stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Listener not yet accepting.
    Starting,
    /// Accepting connections and requests.
    Ready,
    /// Shutdown triggered; no new connections, work is winding down.
    Draining,
    /// Every connection has been released.
    Stopped,
}

/// Coordinates shutdown between the accept loop, connection tasks and the
/// owner of the server.
#[derive(Debug)]
pub struct ShutdownController {
    signal: watch::Sender<bool>,
    open_connections: Arc<AtomicU64>,
    state: ArcSwap<HealthState>,
}

impl ShutdownController {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            signal: tx,
            open_connections: Arc::new(AtomicU64::new(0)),
            state: ArcSwap::from_pointee(HealthState::Starting),
        }
    }

    pub fn set_ready(&self) {
        self.state.store(Arc::new(HealthState::Ready));
    }

    /// Receiver flipped to `true` once shutdown is triggered.
    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.signal.subscribe()
    }

    /// Moves to `Draining` and wakes every shutdown receiver.
    pub fn trigger_shutdown(&self) {
        self.state.store(Arc::new(HealthState::Draining));
        let _ = self.signal.send(true);
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.signal.borrow()
    }

    #[must_use]
    pub fn health_state(&self) -> HealthState {
        **self.state.load()
    }

    /// Counts a connection as open until the guard is dropped.
    #[must_use]
    pub fn connection_guard(&self) -> ConnectionGuard {
        self.open_connections.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            open_connections: Arc::clone(&self.open_connections),
        }
    }

    #[must_use]
    pub fn open_connections(&self) -> u64 {
        self.open_connections.load(Ordering::Relaxed)
    }

    /// Waits until every connection task has finished, up to `timeout`.
    ///
    /// Moves to `Stopped` and returns `true` on success; stays `Draining`
    /// and returns `false` on timeout.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.open_connections() == 0 {
                self.state.store(Arc::new(HealthState::Stopped));
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Held by a connection task for its whole lifetime.
#[derive(Debug)]
pub struct ConnectionGuard {
    open_connections: Arc<AtomicU64>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.open_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_transitions() {
        let controller = ShutdownController::new();
        assert_eq!(controller.health_state(), HealthState::Starting);
        controller.set_ready();
        assert_eq!(controller.health_state(), HealthState::Ready);
        assert!(!controller.is_shutting_down());
        controller.trigger_shutdown();
        assert_eq!(controller.health_state(), HealthState::Draining);
        assert!(controller.is_shutting_down());
    }

    #[test]
    fn guards_count_open_connections() {
        let controller = ShutdownController::new();
        let first = controller.connection_guard();
        let second = controller.connection_guard();
        assert_eq!(controller.open_connections(), 2);
        drop(first);
        assert_eq!(controller.open_connections(), 1);
        drop(second);
        assert_eq!(controller.open_connections(), 0);
    }

    #[tokio::test]
    async fn receiver_sees_trigger() {
        let controller = ShutdownController::new();
        let mut rx = controller.shutdown_receiver();
        assert!(!*rx.borrow());
        controller.trigger_shutdown();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test(start_paused = true)]
    async fn drain_waits_for_guards() {
        let controller = ShutdownController::new();
        controller.trigger_shutdown();
        let guard = controller.connection_guard();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(guard);
        });
        assert!(controller.wait_for_drain(Duration::from_secs(2)).await);
        assert_eq!(controller.health_state(), HealthState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_times_out_with_open_connection() {
        let controller = ShutdownController::new();
        controller.trigger_shutdown();
        let _guard = controller.connection_guard();
        assert!(!controller.wait_for_drain(Duration::from_millis(50)).await);
        assert_eq!(controller.health_state(), HealthState::Draining);
    }
}
