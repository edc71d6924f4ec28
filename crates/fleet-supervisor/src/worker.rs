//! Worker records and restart accounting.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use fleet_core::SlotId;

use crate::runtime::WorkerHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Starting,
    Online,
    /// Asked to disconnect; its exit is expected.
    Draining,
    Exited,
}

impl WorkerStatus {
    /// Starting and online workers count toward pool capacity.
    pub fn is_live(&self) -> bool {
        matches!(self, WorkerStatus::Starting | WorkerStatus::Online)
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerStatus::Starting => "starting",
            WorkerStatus::Online => "online",
            WorkerStatus::Draining => "draining",
            WorkerStatus::Exited => "exited",
        };
        f.write_str(s)
    }
}

/// Load figures last reported by a worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerMetrics {
    /// Percent of one core.
    pub cpu: f64,
    /// Resident memory, MiB.
    pub memory: f64,
    /// Lifetime requests served.
    pub requests: u64,
    /// Lifetime errors.
    pub errors: u64,
}

/// Partial metrics message; absent fields keep their previous value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsUpdate {
    pub cpu: Option<f64>,
    pub memory: Option<f64>,
    pub requests: Option<u64>,
    pub errors: Option<u64>,
}

impl WorkerMetrics {
    pub fn apply(&mut self, update: &MetricsUpdate) {
        if let Some(cpu) = update.cpu {
            self.cpu = cpu;
        }
        if let Some(memory) = update.memory {
            self.memory = memory;
        }
        if let Some(requests) = update.requests {
            self.requests = requests;
        }
        if let Some(errors) = update.errors {
            self.errors = errors;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerRecord {
    pub slot: SlotId,
    pub handle: WorkerHandle,
    pub version: String,
    /// Epoch milliseconds.
    pub started_at: u64,
    pub status: WorkerStatus,
    pub metrics: WorkerMetrics,
    /// Epoch millis of the last message from the worker.
    pub last_seen_at: Option<u64>,
}

impl WorkerRecord {
    pub fn new(slot: SlotId, handle: WorkerHandle, version: &str, started_at: u64) -> Self {
        Self {
            slot,
            handle,
            version: version.to_string(),
            started_at,
            status: WorkerStatus::Starting,
            metrics: WorkerMetrics::default(),
            last_seen_at: None,
        }
    }
}

/// Sliding list of restart timestamps for one slot.
#[derive(Debug, Clone)]
pub struct RestartWindow {
    window: Duration,
    stamps: VecDeque<u64>,
}

impl RestartWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            stamps: VecDeque::new(),
        }
    }

    /// Drop stamps older than the window.
    pub fn prune(&mut self, now: u64) {
        let horizon = now.saturating_sub(self.window.as_millis() as u64);
        while self.stamps.front().is_some_and(|&t| t < horizon) {
            self.stamps.pop_front();
        }
    }

    /// Prune, then admit a restart if fewer than `max` are in the window.
    pub fn try_admit(&mut self, now: u64, max: u32) -> bool {
        self.prune(now);
        if self.stamps.len() < max as usize {
            self.stamps.push_back(now);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.stamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stamps.is_empty()
    }
}
