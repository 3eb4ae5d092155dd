//! Media-agent lifecycle and graceful shutdown.
//!
//! Maintenance work (a scheduler tick, an administrative reconstruction)
//! holds a [`WorkGuard`] while it runs. Shutdown flips the lifecycle to
//! `Draining`, wakes every listener, and then waits for outstanding work.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;

/// Lifecycle of a media agent: `Starting -> Running -> Draining -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Starting,
    /// The maintenance scheduler is running.
    Running,
    /// No new maintenance work starts; running work is finishing.
    Draining,
    Stopped,
}

/// Coordinates shutdown between the binary, the scheduler and running work.
#[derive(Debug)]
pub struct ShutdownController {
    signal: watch::Sender<bool>,
    active_work: Arc<AtomicU64>,
    state: Arc<ArcSwap<AgentState>>,
}

impl ShutdownController {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            signal: tx,
            active_work: Arc::new(AtomicU64::new(0)),
            state: Arc::new(ArcSwap::from_pointee(AgentState::Starting)),
        }
    }

    pub fn set_running(&self) {
        self.state.store(Arc::new(AgentState::Running));
    }

    /// Receiver that flips to `true` once shutdown is triggered.
    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.signal.subscribe()
    }

    pub fn trigger_shutdown(&self) {
        self.state.store(Arc::new(AgentState::Draining));
        self.signal.send_replace(true);
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        matches!(self.state(), AgentState::Draining | AgentState::Stopped)
    }

    #[must_use]
    pub fn state(&self) -> AgentState {
        **self.state.load()
    }

    /// Marks a unit of maintenance work as running until the guard drops.
    #[must_use]
    pub fn work_guard(&self) -> WorkGuard {
        self.active_work.fetch_add(1, Ordering::Relaxed);
        WorkGuard {
            active_work: Arc::clone(&self.active_work),
        }
    }

    #[must_use]
    pub fn active_work(&self) -> u64 {
        self.active_work.load(Ordering::Relaxed)
    }

    /// Waits up to `timeout` for running work to finish.
    ///
    /// Returns `true` and moves to `Stopped` once nothing is running;
    /// returns `false` on timeout and stays `Draining`.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.active_work() == 0 {
                self.state.store(Arc::new(AgentState::Stopped));
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

/// Decrements the running-work counter on drop, including during unwinding.
#[derive(Debug)]
pub struct WorkGuard {
    active_work: Arc<AtomicU64>,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        self.active_work.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_moves_forward() {
        let controller = ShutdownController::new();
        assert_eq!(controller.state(), AgentState::Starting);
        controller.set_running();
        assert_eq!(controller.state(), AgentState::Running);
        assert!(!controller.is_shutting_down());
        controller.trigger_shutdown();
        assert_eq!(controller.state(), AgentState::Draining);
        assert!(controller.is_shutting_down());
    }

    #[test]
    fn work_guards_are_counted() {
        let controller = ShutdownController::new();
        let tick = controller.work_guard();
        let rebuild = controller.work_guard();
        assert_eq!(controller.active_work(), 2);
        drop(tick);
        assert_eq!(controller.active_work(), 1);
        drop(rebuild);
        assert_eq!(controller.active_work(), 0);
    }

    #[tokio::test]
    async fn receivers_see_the_trigger() {
        let controller = ShutdownController::new();
        let mut rx = controller.shutdown_receiver();
        assert!(!*rx.borrow());
        controller.trigger_shutdown();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test(start_paused = true)]
    async fn drain_waits_for_running_work() {
        let controller = ShutdownController::new();
        controller.set_running();
        let guard = controller.work_guard();
        controller.trigger_shutdown();
        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(guard);
        });

        assert!(controller.wait_for_drain(Duration::from_secs(30)).await);
        assert_eq!(controller.state(), AgentState::Stopped);
        release.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn drain_times_out_while_work_is_held() {
        let controller = ShutdownController::new();
        let _guard = controller.work_guard();
        controller.trigger_shutdown();
        assert!(!controller.wait_for_drain(Duration::from_secs(1)).await);
        assert_eq!(controller.state(), AgentState::Draining);
    }
}
