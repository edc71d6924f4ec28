//! Metrics source derived from the pool, the ladder and the health monitor.
//!
//! | path              | meaning                                              |
//! |-------------------|------------------------------------------------------|
//! | `cpu`             | average CPU of live workers, percent of one core     |
//! | `memory`          | pool resident memory as a percent of host memory     |
//! | `memory.mb`       | average resident memory of live workers, MiB         |
//! | `workers.total`   | live workers                                         |
//! | `workers.online`  | workers that have reported in                        |
//! | `workers.crashes` | crashes recorded in the last five minutes            |
//! | `requests.total`  | lifetime requests reported by workers                |
//! | `errors.total`    | lifetime errors reported by workers                  |
//! | `errors.recent`   | ladder records in the last five minutes              |
//! | `health.status`   | overall health as text                               |

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use fleet_core::{BoxFuture, MetricsSnapshot, MetricsSource, SharedClock};
use fleet_escalation::{ErrorKind, ErrorLadder, ErrorRecord};
use fleet_health::HealthMonitor;
use fleet_supervisor::{PoolStatus, SupervisorHandle};

pub const RECENT_WINDOW: Duration = Duration::from_secs(300);

pub struct PoolMetrics {
    supervisor: SupervisorHandle,
    ladder: Arc<ErrorLadder>,
    health: Arc<HealthMonitor>,
    clock: SharedClock,
    recent_capacity: usize,
    host_memory_mb: Option<f64>,
}

impl PoolMetrics {
    pub fn new(
        supervisor: SupervisorHandle,
        ladder: Arc<ErrorLadder>,
        health: Arc<HealthMonitor>,
        clock: SharedClock,
        recent_capacity: usize,
    ) -> Self {
        Self {
            supervisor,
            ladder,
            health,
            clock,
            recent_capacity,
            host_memory_mb: host_memory_mb(),
        }
    }

    async fn collect(&self) -> MetricsSnapshot {
        let now = self.clock.now_millis();
        let mut snap = MetricsSnapshot::new(now);

        match self.supervisor.status().await {
            Ok(status) => pool_figures(&mut snap, &status, self.host_memory_mb),
            Err(e) => warn!(error = %e, "pool status unavailable for metrics"),
        }

        let recent = self.ladder.recent(self.recent_capacity);
        let (errors, crashes) = recent_counts(&recent, now);
        snap.insert("errors.recent", errors);
        snap.insert("workers.crashes", crashes);
        snap.insert("health.status", self.health.overall().await.as_str());
        snap
    }
}

impl MetricsSource for PoolMetrics {
    fn snapshot(&self) -> BoxFuture<'_, MetricsSnapshot> {
        Box::pin(self.collect())
    }
}

fn pool_figures(snap: &mut MetricsSnapshot, status: &PoolStatus, host_memory_mb: Option<f64>) {
    snap.insert("cpu", status.avg_cpu());
    snap.insert("memory.mb", status.avg_memory());
    if let Some(host) = host_memory_mb.filter(|h| *h > 0.0) {
        let used: f64 = status
            .workers
            .iter()
            .filter(|w| w.status.is_live())
            .map(|w| w.metrics.memory)
            .sum();
        snap.insert("memory", used / host * 100.0);
    }
    snap.insert("workers.total", status.live as u64);
    snap.insert("workers.online", status.online as u64);
    snap.insert("requests.total", status.total_requests());
    snap.insert("errors.total", status.total_errors());
}

/// (all records, crash records) stamped within `RECENT_WINDOW` of `now`.
fn recent_counts(records: &[ErrorRecord], now: u64) -> (u64, u64) {
    let horizon = now.saturating_sub(RECENT_WINDOW.as_millis() as u64);
    records
        .iter()
        .filter(|r| r.timestamp >= horizon)
        .fold((0, 0), |(all, crashes), r| {
            (all + 1, crashes + u64::from(r.kind == ErrorKind::WorkerCrash))
        })
}

fn host_memory_mb() -> Option<f64> {
    // SAFETY: sysconf only reads system configuration values.
    let (pages, page_size) = unsafe {
        (
            libc::sysconf(libc::_SC_PHYS_PAGES),
            libc::sysconf(libc::_SC_PAGESIZE),
        )
    };
    if pages <= 0 || page_size <= 0 {
        return None;
    }
    Some(pages as f64 * page_size as f64 / (1024.0 * 1024.0))
}
