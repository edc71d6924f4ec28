//! Built-in probes and the config → probe wiring.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use fleet_core::config::{HealthConfig, ProbeKind, RemediationConfig};
use fleet_core::{BoxFuture, parse_duration};
use fleet_health::{HealthCheckResult, HttpProbe, Probe, ProbeOutcome, Remediation};
use fleet_supervisor::{PoolStatus, SupervisorHandle};

/// Online workers against the configured minimum.
pub struct PoolProbe {
    supervisor: SupervisorHandle,
    min_workers: u32,
}

impl PoolProbe {
    pub fn new(supervisor: SupervisorHandle, min_workers: u32) -> Self {
        Self {
            supervisor,
            min_workers,
        }
    }
}

impl Probe for PoolProbe {
    fn check(&self) -> BoxFuture<'_, anyhow::Result<ProbeOutcome>> {
        Box::pin(async move {
            let status = self.supervisor.status().await?;
            Ok(assess_pool(&status, self.min_workers))
        })
    }
}

fn assess_pool(status: &PoolStatus, min_workers: u32) -> ProbeOutcome {
    if status.online == 0 {
        ProbeOutcome::unhealthy(format!("no online workers ({} starting)", status.live))
    } else if (status.live as u32) < min_workers {
        ProbeOutcome::degraded(format!("{} live workers, minimum is {min_workers}", status.live))
    } else {
        ProbeOutcome::healthy()
    }
}

/// Average worker memory against a limit in MiB.
pub struct MemoryProbe {
    supervisor: SupervisorHandle,
    limit_mb: f64,
}

impl MemoryProbe {
    pub fn new(supervisor: SupervisorHandle, limit_mb: f64) -> Self {
        Self {
            supervisor,
            limit_mb,
        }
    }
}

impl Probe for MemoryProbe {
    fn check(&self) -> BoxFuture<'_, anyhow::Result<ProbeOutcome>> {
        Box::pin(async move {
            let status = self.supervisor.status().await?;
            Ok(assess_memory(status.avg_memory(), self.limit_mb))
        })
    }
}

fn assess_memory(avg_mb: f64, limit_mb: f64) -> ProbeOutcome {
    if avg_mb > limit_mb {
        ProbeOutcome::unhealthy(format!("average worker memory {avg_mb:.0} MiB over limit {limit_mb:.0} MiB"))
    } else if avg_mb > limit_mb * 0.8 {
        ProbeOutcome::degraded(format!("average worker memory {avg_mb:.0} MiB near limit {limit_mb:.0} MiB"))
    } else {
        ProbeOutcome::healthy()
    }
}

pub struct ConfiguredProbe {
    pub name: String,
    pub probe: Arc<dyn Probe>,
    pub remediation: Option<Remediation>,
}

/// Turn the `[[health.probes]]` table into probes and remediations.
pub fn build_probes(
    cfg: &HealthConfig,
    supervisor: &SupervisorHandle,
    min_workers: u32,
) -> anyhow::Result<Vec<ConfiguredProbe>> {
    let mut out = Vec::with_capacity(cfg.probes.len());
    for probe_cfg in &cfg.probes {
        let probe: Arc<dyn Probe> = match &probe_cfg.kind {
            ProbeKind::Http { url } => Arc::new(
                HttpProbe::new(url).with_context(|| format!("probe {}", probe_cfg.name))?,
            ),
            ProbeKind::Pool => Arc::new(PoolProbe::new(supervisor.clone(), min_workers)),
            ProbeKind::Memory { limit_mb } => Arc::new(MemoryProbe::new(supervisor.clone(), *limit_mb)),
        };
        let remediation = probe_cfg
            .remediation
            .as_ref()
            .map(|r| remediation(r, supervisor));
        out.push(ConfiguredProbe {
            name: probe_cfg.name.clone(),
            probe,
            remediation,
        });
    }
    Ok(out)
}

fn remediation(cfg: &RemediationConfig, supervisor: &SupervisorHandle) -> Remediation {
    match cfg {
        RemediationConfig::MemoryPressure => {
            let supervisor = supervisor.clone();
            Remediation::Hook(Arc::new(move |check: HealthCheckResult| -> BoxFuture<'static, ()> {
                let supervisor = supervisor.clone();
                Box::pin(async move {
                    match supervisor.recycle_heaviest().await {
                        Ok(Some(slot)) => info!(check = %check.check_name, slot, "memory pressure: recycled worker"),
                        Ok(None) => warn!(check = %check.check_name, "memory pressure: no worker to recycle"),
                        Err(e) => warn!(check = %check.check_name, error = %e, "memory pressure relief failed"),
                    }
                })
            }))
        }
        RemediationConfig::OpenBreaker {
            resource,
            retry_after,
        } => Remediation::OpenBreaker {
            resource: resource.clone(),
            retry_after: parse_duration(retry_after).unwrap_or(Duration::from_secs(60)),
        },
    }
}
