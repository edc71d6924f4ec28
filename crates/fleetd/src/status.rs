//! JSON status report.

use std::path::Path;

use anyhow::Context;
use serde::Serialize;

use fleet_autoscale::ScalingState;
use fleet_core::{HealthStatus, SystemPhase};
use fleet_escalation::LadderStatus;
use fleet_health::{CircuitBreakerRecord, HealthCheckResult};
use fleet_rollout::DeploymentState;
use fleet_supervisor::PoolStatus;

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// Epoch milliseconds.
    pub generated_at: u64,
    pub phase: SystemPhase,
    /// Absent once the supervisor has stopped.
    pub pool: Option<PoolStatus>,
    pub health: HealthSection,
    pub errors: LadderStatus,
    pub deployment: DeploymentState,
    pub scaling: Option<ScalingState>,
    pub alerts: AlertSection,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSection {
    pub overall: HealthStatus,
    pub checks: Vec<HealthCheckResult>,
    pub breakers: Vec<CircuitBreakerRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertSection {
    /// Rules whose condition currently holds.
    pub active: Vec<String>,
    /// Alerts waiting in the aggregation buffer.
    pub pending: usize,
}

impl StatusReport {
    /// Write pretty JSON next to `path`, then rename over it.
    pub async fn write_to(&self, path: &Path) -> anyhow::Result<()> {
        let body = serde_json::to_vec_pretty(self).context("encoding status report")?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, body)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("renaming to {}", path.display()))?;
        Ok(())
    }
}
