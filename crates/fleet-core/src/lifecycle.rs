//! System lifecycle phase shared by every component.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Coarse phase of the supervising process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemPhase {
    Running,
    ShuttingDown,
    Failed,
    Stopped,
}

impl fmt::Display for SystemPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SystemPhase::Running => "running",
            SystemPhase::ShuttingDown => "shutting_down",
            SystemPhase::Failed => "failed",
            SystemPhase::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Cloneable handle to the shared phase.
///
/// Only `Running` accepts new scale, restart or deploy actions. A system
/// that failed ends in `Failed` rather than `Stopped`.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    tx: watch::Sender<SystemPhase>,
    failed: Arc<AtomicBool>,
}

impl Lifecycle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SystemPhase::Running);
        Self {
            tx,
            failed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn phase(&self) -> SystemPhase {
        *self.tx.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.phase() == SystemPhase::Running
    }

    /// Move to `ShuttingDown`. Returns `true` only for the caller that
    /// performed the transition, so shutdown work runs once.
    pub fn begin_shutdown(&self) -> bool {
        self.tx.send_if_modified(|phase| match phase {
            SystemPhase::Running | SystemPhase::Failed => {
                *phase = SystemPhase::ShuttingDown;
                true
            }
            _ => false,
        })
    }

    /// Mark the system failed. A failed system still shuts down afterwards.
    pub fn mark_failed(&self) {
        self.failed.store(true, Ordering::SeqCst);
        self.tx.send_if_modified(|phase| {
            if *phase == SystemPhase::Running {
                *phase = SystemPhase::Failed;
                true
            } else {
                false
            }
        });
    }

    /// Whether `mark_failed` was ever called.
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Terminal phase: `Failed` after a failure, `Stopped` otherwise.
    pub fn mark_stopped(&self) {
        let terminal = if self.has_failed() {
            SystemPhase::Failed
        } else {
            SystemPhase::Stopped
        };
        self.tx.send_replace(terminal);
    }

    pub fn subscribe(&self) -> watch::Receiver<SystemPhase> {
        self.tx.subscribe()
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_running() {
        let lc = Lifecycle::new();
        assert!(lc.is_running());
    }

    #[test]
    fn begin_shutdown_is_idempotent() {
        let lc = Lifecycle::new();
        assert!(lc.begin_shutdown());
        assert!(!lc.begin_shutdown());
        assert_eq!(lc.phase(), SystemPhase::ShuttingDown);
    }

    #[test]
    fn failed_system_can_still_shut_down() {
        let lc = Lifecycle::new();
        lc.mark_failed();
        assert_eq!(lc.phase(), SystemPhase::Failed);
        assert!(!lc.is_running());
        assert!(lc.begin_shutdown());
    }

    #[test]
    fn failure_survives_shutdown() {
        let lc = Lifecycle::new();
        lc.mark_failed();
        lc.begin_shutdown();
        assert_eq!(lc.phase(), SystemPhase::ShuttingDown);
        lc.mark_stopped();
        assert_eq!(lc.phase(), SystemPhase::Failed);
        assert!(lc.has_failed());
    }

    #[test]
    fn clean_shutdown_ends_stopped() {
        let lc = Lifecycle::new();
        lc.begin_shutdown();
        lc.mark_stopped();
        assert_eq!(lc.phase(), SystemPhase::Stopped);
        assert!(!lc.has_failed());
    }

    #[tokio::test]
    async fn subscribers_observe_transitions() {
        let lc = Lifecycle::new();
        let mut rx = lc.subscribe();
        lc.begin_shutdown();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), SystemPhase::ShuttingDown);
    }
}
