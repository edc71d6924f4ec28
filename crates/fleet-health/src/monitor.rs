//! Health monitor — runs probes, aggregates, remediates.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, broadcast};
use tracing::{debug, info, warn};

use fleet_core::{BoxFuture, HealthStatus, SharedClock};

use crate::breaker::BreakerRegistry;
use crate::checker::{HealthCheckResult, Probe, run_probe};

/// Callback invoked with the failing check's latest result.
pub type RemediationHook = Arc<dyn Fn(HealthCheckResult) -> BoxFuture<'static, ()> + Send + Sync>;

/// What happens to a failing check when the system is unhealthy.
#[derive(Clone)]
pub enum Remediation {
    /// Run an arbitrary async hook (e.g. memory pressure relief).
    Hook(RemediationHook),
    /// Open the named resource's circuit breaker.
    OpenBreaker {
        resource: String,
        retry_after: Duration,
    },
}

impl std::fmt::Debug for Remediation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Remediation::Hook(_) => f.write_str("Hook(..)"),
            Remediation::OpenBreaker {
                resource,
                retry_after,
            } => f
                .debug_struct("OpenBreaker")
                .field("resource", resource)
                .field("retry_after", retry_after)
                .finish(),
        }
    }
}

/// Emitted whenever the overall status changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthEvent {
    pub previous: HealthStatus,
    pub current: HealthStatus,
    pub at: u64,
}

/// Outcome of one `tick()`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub overall: HealthStatus,
    pub checked_at: u64,
    pub checks: Vec<HealthCheckResult>,
}

impl HealthReport {
    pub fn failing(&self) -> impl Iterator<Item = &HealthCheckResult> {
        self.checks
            .iter()
            .filter(|c| c.status != HealthStatus::Healthy)
    }
}

/// Worst-of: any unhealthy → unhealthy, else any degraded → degraded.
/// An empty set is healthy.
pub fn aggregate<'a>(statuses: impl IntoIterator<Item = &'a HealthStatus>) -> HealthStatus {
    statuses.into_iter().copied().max().unwrap_or_default()
}

struct Registered {
    probe: Arc<dyn Probe>,
    remediation: Option<Remediation>,
}

pub struct HealthMonitor {
    probes: RwLock<BTreeMap<String, Registered>>,
    results: RwLock<BTreeMap<String, HealthCheckResult>>,
    overall: RwLock<HealthStatus>,
    probe_timeout: Duration,
    clock: SharedClock,
    breakers: Arc<BreakerRegistry>,
    /// Serialises concurrent `tick()` callers.
    tick_lock: Mutex<()>,
    events: broadcast::Sender<HealthEvent>,
}

impl HealthMonitor {
    pub fn new(probe_timeout: Duration, clock: SharedClock) -> Self {
        Self::with_breakers(probe_timeout, clock, Arc::new(BreakerRegistry::new()))
    }

    pub fn with_breakers(
        probe_timeout: Duration,
        clock: SharedClock,
        breakers: Arc<BreakerRegistry>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            probes: RwLock::new(BTreeMap::new()),
            results: RwLock::new(BTreeMap::new()),
            overall: RwLock::new(HealthStatus::Healthy),
            probe_timeout,
            clock,
            breakers,
            tick_lock: Mutex::new(()),
            events,
        }
    }

    /// Register (or replace) a probe under `name`.
    pub async fn register_probe(
        &self,
        name: &str,
        probe: Arc<dyn Probe>,
        remediation: Option<Remediation>,
    ) {
        let mut probes = self.probes.write().await;
        if probes
            .insert(name.to_string(), Registered { probe, remediation })
            .is_some()
        {
            debug!(check = %name, "health probe replaced");
        } else {
            debug!(check = %name, "health probe registered");
        }
    }

    pub async fn unregister_probe(&self, name: &str) -> bool {
        let removed = self.probes.write().await.remove(name).is_some();
        self.results.write().await.remove(name);
        removed
    }

    /// Run every probe once, concurrently, and fold the results.
    pub async fn tick(&self) -> HealthReport {
        let _guard = self.tick_lock.lock().await;

        let probes: Vec<(String, Arc<dyn Probe>, Option<Remediation>)> = {
            let probes = self.probes.read().await;
            probes
                .iter()
                .map(|(name, r)| (name.clone(), r.probe.clone(), r.remediation.clone()))
                .collect()
        };

        let clock = self.clock.as_ref();
        let runs = probes
            .iter()
            .map(|(name, probe, _)| run_probe(name, probe.clone(), self.probe_timeout, clock));
        let checks = join_all(runs).await;

        let overall = aggregate(checks.iter().map(|c| &c.status));
        let now = self.clock.now_millis();

        {
            let mut results = self.results.write().await;
            results.clear();
            for check in &checks {
                results.insert(check.check_name.clone(), check.clone());
            }
        }

        let previous = {
            let mut current = self.overall.write().await;
            std::mem::replace(&mut *current, overall)
        };
        if previous != overall {
            info!(from = %previous, to = %overall, "overall health changed");
            let _ = self.events.send(HealthEvent {
                previous,
                current: overall,
                at: now,
            });
        }

        if overall == HealthStatus::Unhealthy {
            for (check, (_, _, remediation)) in checks.iter().zip(probes.iter()) {
                if check.status != HealthStatus::Unhealthy {
                    continue;
                }
                self.remediate(check, remediation.as_ref(), now).await;
            }
        }

        HealthReport {
            overall,
            checked_at: now,
            checks,
        }
    }

    async fn remediate(&self, check: &HealthCheckResult, remediation: Option<&Remediation>, now: u64) {
        match remediation {
            Some(Remediation::Hook(hook)) => {
                info!(check = %check.check_name, "running remediation hook");
                hook(check.clone()).await;
            }
            Some(Remediation::OpenBreaker {
                resource,
                retry_after,
            }) => {
                self.breakers.open(resource, now, *retry_after);
            }
            None => {
                warn!(
                    check = %check.check_name,
                    message = check.message.as_deref().unwrap_or(""),
                    "check failing with no remediation registered"
                );
            }
        }
    }

    /// Overall status as of the last tick. Healthy before the first tick.
    pub async fn overall(&self) -> HealthStatus {
        *self.overall.read().await
    }

    /// Latest result of every probe, ordered by name.
    pub async fn results(&self) -> Vec<HealthCheckResult> {
        self.results.read().await.values().cloned().collect()
    }

    pub async fn probe_names(&self) -> Vec<String> {
        self.probes.read().await.keys().cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }
}
