//! Rollout controller — deployment state and the rolling procedure.
//!
//! Only one rollout (deploy or manual rollback) runs at a time. The
//! deployment state is updated before any worker is touched, so a status
//! query during a rollout already reports the target version.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use fleet_core::{BoxFuture, HealthStatus, Lifecycle, SharedClock, SlotId};
use fleet_health::HealthMonitor;

use crate::error::{RollbackOutcome, RolloutError, RolloutResult};
use crate::strategy::{DeployOptions, RolloutStrategy, partition};

/// The pool being rolled.
pub trait RolloutTarget: Send + Sync {
    /// Slots of the workers to replace, in replacement order.
    fn live_slots(&self) -> BoxFuture<'_, anyhow::Result<Vec<SlotId>>>;

    /// Version handed to workers spawned from now on.
    fn set_version<'a>(&'a self, version: &'a str) -> BoxFuture<'a, anyhow::Result<()>>;

    /// Replace one worker and wait for its successor.
    fn replace(&self, slot: SlotId) -> BoxFuture<'_, anyhow::Result<()>>;
}

/// Post-batch health check.
pub trait HealthGate: Send + Sync {
    fn check(&self) -> BoxFuture<'_, HealthStatus>;
}

impl HealthGate for HealthMonitor {
    fn check(&self) -> BoxFuture<'_, HealthStatus> {
        Box::pin(async move { self.tick().await.overall })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub version: String,
    /// Epoch milliseconds.
    pub deployed_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeploymentState {
    pub version: String,
    pub deployed_at: u64,
    /// Newest first.
    pub history: VecDeque<HistoryEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployReport {
    pub version: String,
    pub previous: String,
    pub batches: usize,
    pub replaced: usize,
}

enum Pass {
    Complete { batches: usize, replaced: usize },
    GateFailed { batch: usize, batches: usize },
}

pub struct RolloutController {
    target: Arc<dyn RolloutTarget>,
    gate: Arc<dyn HealthGate>,
    lifecycle: Lifecycle,
    clock: SharedClock,
    history_limit: usize,
    state: Mutex<DeploymentState>,
    busy: tokio::sync::Mutex<()>,
}

impl RolloutController {
    pub fn new(
        version: &str,
        history_limit: usize,
        target: Arc<dyn RolloutTarget>,
        gate: Arc<dyn HealthGate>,
        lifecycle: Lifecycle,
        clock: SharedClock,
    ) -> Self {
        let state = DeploymentState {
            version: version.to_string(),
            deployed_at: clock.now_millis(),
            history: VecDeque::new(),
        };
        Self {
            target,
            gate,
            lifecycle,
            clock,
            history_limit,
            state: Mutex::new(state),
            busy: tokio::sync::Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DeploymentState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> DeploymentState {
        self.lock().clone()
    }

    pub fn version(&self) -> String {
        self.lock().version.clone()
    }

    pub fn in_progress(&self) -> bool {
        self.busy.try_lock().is_err()
    }

    /// Push the current version onto history and switch to `version`.
    /// Returns the version deployed from.
    fn record_deploy(&self, version: &str) -> String {
        let now = self.clock.now_millis();
        let mut state = self.lock();
        let previous = HistoryEntry {
            version: std::mem::replace(&mut state.version, version.to_string()),
            deployed_at: state.deployed_at,
        };
        let from = previous.version.clone();
        state.history.push_front(previous);
        state.history.truncate(self.history_limit);
        state.deployed_at = now;
        from
    }

    fn switch_to(&self, version: &str) {
        let now = self.clock.now_millis();
        let mut state = self.lock();
        state.version = version.to_string();
        state.deployed_at = now;
    }

    /// Roll the pool to `version`.
    ///
    /// A failed health gate is always an error, even when the rollback
    /// that follows succeeds; the error carries the rollback outcome.
    pub async fn deploy(&self, version: &str, options: &DeployOptions) -> RolloutResult<DeployReport> {
        if options.strategy != RolloutStrategy::Rolling {
            return Err(RolloutError::Unsupported(options.strategy));
        }
        if !self.lifecycle.is_running() {
            return Err(RolloutError::NotRunning);
        }
        let _guard = self.busy.try_lock().map_err(|_| RolloutError::InProgress)?;

        let previous = self.record_deploy(version);
        info!(from = %previous, to = %version, batches = options.batches, "deploy started");
        self.target
            .set_version(version)
            .await
            .map_err(RolloutError::target)?;

        match self.rolling_pass(version, options).await? {
            Pass::Complete { batches, replaced } => {
                info!(version, batches, replaced, "deploy completed");
                Ok(DeployReport {
                    version: version.to_string(),
                    previous,
                    batches,
                    replaced,
                })
            }
            Pass::GateFailed { batch, batches } => {
                let rollback = if options.rollback_on_failure {
                    self.restore(&previous, options).await
                } else {
                    RollbackOutcome::Disabled
                };
                error!(version, batch, batches, %rollback, "deploy failed health gate");
                Err(RolloutError::HealthGate {
                    version: version.to_string(),
                    batch,
                    batches,
                    rollback,
                })
            }
        }
    }

    async fn restore(&self, version: &str, options: &DeployOptions) -> RollbackOutcome {
        warn!(version, "rolling back");
        self.switch_to(version);
        if let Err(e) = self.target.set_version(version).await {
            return RollbackOutcome::Failed {
                version: version.to_string(),
                reason: format!("{e:#}"),
            };
        }
        match self.rolling_pass(version, options).await {
            Ok(Pass::Complete { .. }) => RollbackOutcome::RolledBack {
                version: version.to_string(),
            },
            Ok(Pass::GateFailed { batch, batches }) => RollbackOutcome::Failed {
                version: version.to_string(),
                reason: format!("health gate failed at batch {batch}/{batches}"),
            },
            Err(e) => RollbackOutcome::Failed {
                version: version.to_string(),
                reason: e.to_string(),
            },
        }
    }

    /// Return to the newest history entry, consuming it.
    pub async fn rollback(&self, options: &DeployOptions) -> RolloutResult<String> {
        if !self.lifecycle.is_running() {
            return Err(RolloutError::NotRunning);
        }
        let _guard = self.busy.try_lock().map_err(|_| RolloutError::InProgress)?;

        let entry = self.lock().history.pop_front().ok_or(RolloutError::NoHistory)?;
        let version = entry.version;
        info!(to = %version, "manual rollback started");
        self.switch_to(&version);
        self.target
            .set_version(&version)
            .await
            .map_err(RolloutError::target)?;

        match self.rolling_pass(&version, options).await? {
            Pass::Complete { .. } => Ok(version),
            Pass::GateFailed { batch, batches } => Err(RolloutError::HealthGate {
                version,
                batch,
                batches,
                rollback: RollbackOutcome::Disabled,
            }),
        }
    }

    async fn rolling_pass(&self, version: &str, options: &DeployOptions) -> RolloutResult<Pass> {
        let slots = self.target.live_slots().await.map_err(RolloutError::target)?;
        let groups = partition(&slots, options.batches);
        let batches = groups.len();
        let mut replaced = 0;

        for (i, group) in groups.iter().enumerate() {
            let batch = i + 1;
            info!(version, batch, batches, workers = group.len(), "rolling batch");

            for &slot in group {
                if !self.lifecycle.is_running() {
                    return Err(RolloutError::NotRunning);
                }
                match self.target.replace(slot).await {
                    Ok(()) => replaced += 1,
                    Err(e) => warn!(slot, error = %format!("{e:#}"), "worker replacement failed"),
                }
                tokio::time::sleep(options.settle_delay).await;
            }

            tokio::time::sleep(options.soak_period).await;
            let status = self.gate.check().await;
            if status == HealthStatus::Unhealthy {
                warn!(version, batch, batches, "health gate failed");
                return Ok(Pass::GateFailed { batch, batches });
            }
            debug!(version, batch, %status, "health gate passed");
        }

        Ok(Pass::Complete { batches, replaced })
    }
}
