//! The escalation ladder.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tracing::{error, info, warn};

use fleet_core::config::EscalationConfig;
use fleet_core::{BoxFuture, Lifecycle, Severity, SharedClock};

use crate::record::{ErrorKind, ErrorRecord};

/// Exit code used when the fatal rung terminates the process.
pub const FATAL_EXIT_CODE: i32 = 1;

/// What the ladder can ask the rest of the system to do.
pub trait RecoveryActions: Send + Sync {
    fn alert(&self, severity: Severity, message: String) -> BoxFuture<'_, ()>;
    /// Restart the worker pool.
    fn restart(&self) -> BoxFuture<'_, anyhow::Result<()>>;
    /// Roll back to the previous deployment.
    fn rollback(&self) -> BoxFuture<'_, anyhow::Result<()>>;
    /// Graceful shutdown of every component.
    fn shutdown(&self) -> BoxFuture<'_, ()>;
    /// End the process with `code` once shutdown is done.
    fn terminate(&self, code: i32);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Rung {
    Normal,
    Warning,
    Critical,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Thresholds {
    pub warning: u64,
    pub critical: u64,
    pub fatal: u64,
}

impl Thresholds {
    pub fn rung(&self, total: u64) -> Rung {
        if total >= self.fatal {
            Rung::Fatal
        } else if total >= self.critical {
            Rung::Critical
        } else if total >= self.warning {
            Rung::Warning
        } else {
            Rung::Normal
        }
    }
}

impl From<&EscalationConfig> for Thresholds {
    fn from(cfg: &EscalationConfig) -> Self {
        Self {
            warning: cfg.warning,
            critical: cfg.critical,
            fatal: cfg.fatal,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LadderStatus {
    pub total: u64,
    pub rung: Rung,
    pub thresholds: Thresholds,
    pub by_kind: BTreeMap<ErrorKind, u64>,
    /// Newest last.
    pub recent: Vec<ErrorRecord>,
}

struct Counters {
    total: u64,
    by_kind: BTreeMap<ErrorKind, u64>,
    recent: VecDeque<ErrorRecord>,
}

pub struct ErrorLadder {
    counters: Mutex<Counters>,
    capacity: usize,
    thresholds: Thresholds,
    actions: Arc<dyn RecoveryActions>,
    lifecycle: Lifecycle,
    clock: SharedClock,
    fatal_started: AtomicBool,
}

impl ErrorLadder {
    pub fn new(
        cfg: &EscalationConfig,
        actions: Arc<dyn RecoveryActions>,
        lifecycle: Lifecycle,
        clock: SharedClock,
    ) -> Self {
        let capacity = cfg.recent_capacity.max(1);
        Self {
            counters: Mutex::new(Counters {
                total: 0,
                by_kind: BTreeMap::new(),
                recent: VecDeque::with_capacity(capacity),
            }),
            capacity,
            thresholds: Thresholds::from(cfg),
            actions,
            lifecycle,
            clock,
            fatal_started: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, kind: ErrorKind, message: &str) -> u64 {
        let record = ErrorRecord::new(kind, message, self.clock.now_millis());
        let mut c = self.lock();
        c.total += 1;
        *c.by_kind.entry(kind).or_insert(0) += 1;
        if c.recent.len() >= self.capacity {
            c.recent.pop_front();
        }
        c.recent.push_back(record);
        c.total
    }

    /// Count one failure and run whatever rung the new total reaches.
    pub async fn record(&self, kind: ErrorKind, message: impl Into<String>) -> Rung {
        let message = message.into();
        let total = self.push(kind, &message);
        let rung = self.thresholds.rung(total);
        self.run(rung, kind, &message, total).await;
        rung
    }

    /// Count one failure and run at least the critical rung.
    pub async fn escalate(&self, kind: ErrorKind, message: impl Into<String>) -> Rung {
        let message = message.into();
        let total = self.push(kind, &message);
        let rung = self.thresholds.rung(total).max(Rung::Critical);
        warn!(kind = %kind, total, "escalating straight to {rung:?}");
        self.run(rung, kind, &message, total).await;
        rung
    }

    async fn run(&self, rung: Rung, kind: ErrorKind, message: &str, total: u64) {
        match rung {
            Rung::Normal => {}
            Rung::Warning => {
                warn!(kind = %kind, total, "error count over warning threshold");
                self.actions
                    .alert(
                        Severity::Warning,
                        format!("{total} errors recorded (latest {kind}: {message})"),
                    )
                    .await;
            }
            Rung::Critical => self.run_critical(kind, message, total).await,
            Rung::Fatal => self.run_fatal(kind, message, total).await,
        }
    }

    async fn run_critical(&self, kind: ErrorKind, message: &str, total: u64) {
        if !self.lifecycle.is_running() {
            info!(kind = %kind, "not running, skipping recovery");
            return;
        }

        error!(kind = %kind, total, "error count over critical threshold, restarting workers");
        let outcome = match self.actions.restart().await {
            Ok(()) => "workers restarted".to_string(),
            Err(e) => {
                error!(error = %e, "restart failed, rolling back");
                match self.actions.rollback().await {
                    Ok(()) => format!("restart failed ({e}); rolled back"),
                    Err(rb) => {
                        error!(error = %rb, "rollback failed");
                        format!("restart failed ({e}); rollback failed ({rb})")
                    }
                }
            }
        };

        self.actions
            .alert(
                Severity::Critical,
                format!("{total} errors recorded (latest {kind}: {message}); {outcome}"),
            )
            .await;
    }

    async fn run_fatal(&self, kind: ErrorKind, message: &str, total: u64) {
        if self.fatal_started.swap(true, Ordering::SeqCst) {
            return;
        }

        error!(kind = %kind, total, "error count over fatal threshold, shutting down");
        self.lifecycle.mark_failed();
        self.actions
            .alert(
                Severity::Critical,
                format!("{total} errors recorded (latest {kind}: {message}); shutting down"),
            )
            .await;
        self.actions.shutdown().await;
        self.actions.terminate(FATAL_EXIT_CODE);
    }

    /// Total failures since start or the last reset.
    pub fn current_count(&self) -> u64 {
        self.lock().total
    }

    pub fn count_of(&self, kind: ErrorKind) -> u64 {
        self.lock().by_kind.get(&kind).copied().unwrap_or(0)
    }

    /// Up to `n` most recent records, newest last.
    pub fn recent(&self, n: usize) -> Vec<ErrorRecord> {
        let c = self.lock();
        let skip = c.recent.len().saturating_sub(n);
        c.recent.iter().skip(skip).cloned().collect()
    }

    /// Clear every counter, re-arming the lower rungs.
    pub fn reset(&self) {
        let mut c = self.lock();
        info!(total = c.total, "error ladder reset");
        c.total = 0;
        c.by_kind.clear();
        c.recent.clear();
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    pub fn status(&self) -> LadderStatus {
        let c = self.lock();
        LadderStatus {
            total: c.total,
            rung: self.thresholds.rung(c.total),
            thresholds: self.thresholds,
            by_kind: c.by_kind.clone(),
            recent: c.recent.iter().cloned().collect(),
        }
    }
}
