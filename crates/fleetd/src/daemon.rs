//! Daemon assembly, periodic tasks and graceful shutdown.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use fleet_alert::{AlertManager, NotificationDispatcher, build_transports};
use fleet_autoscale::{Autoscaler, ScaleDecision, ScalingLimits};
use fleet_core::{
    FleetConfig, HealthStatus, Lifecycle, MetricsSource, SharedClock, SystemPhase, TaskSet,
};
use fleet_escalation::{ErrorKind, ErrorLadder};
use fleet_health::{HealthMonitor, HealthReport};
use fleet_rollout::{DeployOptions, DeployReport, RolloutController, RolloutError};
use fleet_supervisor::{
    Supervisor, SupervisorHandle, SupervisorNotice, SupervisorSettings, WorkerRuntime,
};

use crate::metrics::PoolMetrics;
use crate::pool::Pool;
use crate::probes::build_probes;
use crate::recovery::{FleetRecovery, ShutdownRequest};
use crate::status::{AlertSection, HealthSection, StatusReport};

/// How often the aggregation buffer is checked for a due flush.
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);
/// How long periodic tasks get to finish their current tick on shutdown.
const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Daemon {
    config: FleetConfig,
    lifecycle: Lifecycle,
    clock: SharedClock,
    supervisor: SupervisorHandle,
    supervisor_task: Mutex<Option<JoinHandle<()>>>,
    health: Arc<HealthMonitor>,
    alerts: Arc<AlertManager>,
    ladder: Arc<ErrorLadder>,
    metrics: Arc<PoolMetrics>,
    autoscaler: Option<Arc<Autoscaler>>,
    rollout: Arc<RolloutController>,
    deploy_options: DeployOptions,
    shutdown_request: ShutdownRequest,
    tasks: Mutex<Option<TaskSet>>,
    /// Held for the whole shutdown sequence; `true` once it completed.
    stopped: Mutex<bool>,
}

impl Daemon {
    /// Wire every component, start the configured workers and the
    /// periodic tasks.
    pub async fn start(
        config: FleetConfig,
        runtime: Arc<dyn WorkerRuntime>,
        clock: SharedClock,
    ) -> anyhow::Result<Arc<Self>> {
        config.validate()?;
        let lifecycle = Lifecycle::new();

        // Supervisor.
        let settings = SupervisorSettings::from_config(&config.supervisor, &config.deployment.version);
        let (supervisor, notices, supervisor_task) =
            Supervisor::spawn(settings, runtime, lifecycle.clone(), clock.clone());

        // Health monitor.
        let health = Arc::new(HealthMonitor::new(config.health.probe_timeout(), clock.clone()));
        for probe in build_probes(&config.health, &supervisor, config.supervisor.min_workers)? {
            health
                .register_probe(&probe.name, probe.probe, probe.remediation)
                .await;
        }
        info!(probes = config.health.probes.len(), "health monitor initialized");

        // Alerting.
        let transports = build_transports(&config.transports)?;
        let dispatcher = Arc::new(NotificationDispatcher::new(
            transports,
            config.alerts.delivery_timeout(),
        ));
        info!(transports = ?dispatcher.transport_names(), "notification dispatcher initialized");
        let alerts = Arc::new(AlertManager::from_config(&config.alerts, dispatcher, clock.clone()));

        // Rollout.
        let pool = Arc::new(Pool::new(supervisor.clone()));
        let rollout = Arc::new(RolloutController::new(
            &config.deployment.version,
            config.rollout.history_limit,
            pool.clone(),
            health.clone(),
            lifecycle.clone(),
            clock.clone(),
        ));
        let deploy_options = DeployOptions::from_config(&config.rollout);

        // Escalation.
        let shutdown_request = ShutdownRequest::new();
        let recovery = Arc::new(FleetRecovery::new(
            supervisor.clone(),
            alerts.clone(),
            rollout.clone(),
            deploy_options.clone(),
            shutdown_request.clone(),
            clock.clone(),
        ));
        let ladder = Arc::new(ErrorLadder::new(
            &config.escalation,
            recovery,
            lifecycle.clone(),
            clock.clone(),
        ));

        // Metrics and autoscaling.
        let metrics = Arc::new(PoolMetrics::new(
            supervisor.clone(),
            ladder.clone(),
            health.clone(),
            clock.clone(),
            config.escalation.recent_capacity,
        ));
        let autoscaler = config.autoscale.enabled.then(|| {
            Arc::new(Autoscaler::new(
                config.autoscale.clone(),
                ScalingLimits {
                    min_workers: config.supervisor.min_workers,
                    max_workers: config.supervisor.max_workers,
                },
                metrics.clone(),
                pool.clone(),
                lifecycle.clone(),
                clock.clone(),
            ))
        });

        let started = supervisor.start(config.supervisor.workers).await?;
        info!(
            workers = started.len(),
            version = %config.deployment.version,
            command = %config.supervisor.command,
            "worker pool started"
        );

        let daemon = Arc::new(Self {
            config,
            lifecycle,
            clock,
            supervisor,
            supervisor_task: Mutex::new(Some(supervisor_task)),
            health,
            alerts,
            ladder,
            metrics,
            autoscaler,
            rollout,
            deploy_options,
            shutdown_request,
            tasks: Mutex::new(None),
            stopped: Mutex::new(false),
        });
        daemon.spawn_tasks(notices).await;
        Ok(daemon)
    }

    async fn spawn_tasks(self: &Arc<Self>, mut notices: mpsc::UnboundedReceiver<SupervisorNotice>) {
        let mut tasks = TaskSet::new();

        let d = self.clone();
        tasks.spawn("supervisor-notices", move |mut cancel| async move {
            loop {
                tokio::select! {
                    notice = notices.recv() => match notice {
                        Some(notice) => d.on_notice(notice).await,
                        None => break,
                    },
                    _ = cancel.changed() => break,
                }
            }
            debug!("notice router stopped");
        });

        let d = self.clone();
        tasks.spawn_periodic("metrics", self.config.alerts.interval(), move || {
            let d = d.clone();
            async move { d.metrics_tick().await }
        });

        let d = self.clone();
        tasks.spawn_periodic("health", self.config.health.interval(), move || {
            let d = d.clone();
            async move {
                d.health_tick().await;
            }
        });

        if self.config.alerts.aggregation.enabled {
            let d = self.clone();
            tasks.spawn_periodic("alert-flush", FLUSH_INTERVAL, move || {
                let d = d.clone();
                async move {
                    if let Some(report) = d.alerts.flush_due().await {
                        debug!(delivered = report.delivered.len(), "aggregated alerts flushed");
                    }
                }
            });
        }

        if let Some(scaler) = &self.autoscaler {
            let scaler = scaler.clone();
            tasks.spawn_periodic("autoscale", scaler.interval(), move || {
                let scaler = scaler.clone();
                async move {
                    scaler.tick().await;
                }
            });
        }

        info!(tasks = tasks.len(), "periodic tasks started");
        *self.tasks.lock().await = Some(tasks);
    }

    /// Route one supervisor notice into the escalation ladder.
    pub async fn on_notice(&self, notice: SupervisorNotice) {
        match notice {
            SupervisorNotice::WorkerCrashed {
                slot,
                code,
                signal,
                ..
            } => {
                let how = match (code, signal) {
                    (Some(code), _) => format!("exit code {code}"),
                    (None, Some(signal)) => format!("signal {signal}"),
                    (None, None) => "unknown status".to_string(),
                };
                self.ladder
                    .record(ErrorKind::WorkerCrash, format!("worker {slot} crashed with {how}"))
                    .await;
            }
            SupervisorNotice::RestartLimitExceeded { slot, restarts } => {
                self.ladder
                    .escalate(
                        ErrorKind::RestartLimitExceeded,
                        format!("worker {slot} crashed after {restarts} restarts, slot retired"),
                    )
                    .await;
            }
            SupervisorNotice::WorkerError { slot, message } => {
                self.ladder
                    .record(ErrorKind::WorkerError, format!("worker {slot}: {message}"))
                    .await;
            }
            SupervisorNotice::RestartScheduled {
                slot,
                attempt,
                delay,
            } => debug!(slot, attempt, delay_ms = delay.as_millis() as u64, "restart scheduled"),
            SupervisorNotice::WorkerRestarted { slot, handle } => {
                debug!(slot, handle = %handle, "worker restarted")
            }
            SupervisorNotice::CapacityChanged { live } => debug!(live, "pool capacity changed"),
        }
    }

    /// Snapshot the pool and run the alert rules over it.
    pub async fn metrics_tick(&self) {
        let snapshot = self.metrics.snapshot().await;
        for report in self.alerts.on_metrics(&snapshot).await {
            for (transport, reason) in &report.failed {
                warn!(transport = %transport, error = %reason, "alert delivery failed");
            }
        }
    }

    /// Run every probe; an unhealthy result counts against the ladder.
    pub async fn health_tick(&self) -> HealthReport {
        let report = self.health.tick().await;
        if report.overall == HealthStatus::Unhealthy {
            let failing: Vec<&str> = report
                .failing()
                .filter(|c| c.status == HealthStatus::Unhealthy)
                .map(|c| c.check_name.as_str())
                .collect();
            self.ladder
                .record(
                    ErrorKind::HealthCheckFailed,
                    format!("unhealthy checks: {}", failing.join(", ")),
                )
                .await;
        }
        self.write_status().await;
        report
    }

    pub async fn autoscale_tick(&self) -> Option<ScaleDecision> {
        match &self.autoscaler {
            Some(scaler) => Some(scaler.tick().await),
            None => None,
        }
    }

    /// Roll the pool to `version` with the configured options. A failed
    /// health gate is recorded on the ladder; a success re-arms it.
    pub async fn deploy(&self, version: &str) -> Result<DeployReport, RolloutError> {
        match self.rollout.deploy(version, &self.deploy_options).await {
            Ok(report) => {
                self.ladder.reset();
                Ok(report)
            }
            Err(e) => {
                if matches!(e, RolloutError::HealthGate { .. }) {
                    self.ladder
                        .record(ErrorKind::DeploymentFailed, e.to_string())
                        .await;
                }
                Err(e)
            }
        }
    }

    /// Apply a re-read configuration. Only a changed deployment version
    /// acts; everything else needs a restart.
    pub async fn reload(&self, config: FleetConfig) -> anyhow::Result<Option<DeployReport>> {
        config.validate()?;
        let current = self.rollout.version();
        let wanted = &config.deployment.version;
        if *wanted == current {
            info!(version = %current, "config reloaded, version unchanged");
            return Ok(None);
        }
        info!(from = %current, to = %wanted, "config reloaded, deploying");
        Ok(Some(self.deploy(wanted).await?))
    }

    pub async fn status(&self) -> StatusReport {
        let scaling = match &self.autoscaler {
            Some(scaler) => Some(scaler.state().await),
            None => None,
        };
        StatusReport {
            generated_at: self.clock.now_millis(),
            phase: self.lifecycle.phase(),
            pool: self.supervisor.status().await.ok(),
            health: HealthSection {
                overall: self.health.overall().await,
                checks: self.health.results().await,
                breakers: self.health.breakers().records(),
            },
            errors: self.ladder.status(),
            deployment: self.rollout.state(),
            scaling,
            alerts: AlertSection {
                active: self.alerts.active().await,
                pending: self.alerts.pending().await,
            },
        }
    }

    pub fn status_path(&self) -> Option<&PathBuf> {
        self.config.status.path.as_ref()
    }

    async fn write_status(&self) {
        let Some(path) = self.status_path() else {
            return;
        };
        if let Err(e) = self.status().await.write_to(path).await {
            warn!(path = %path.display(), error = %format!("{e:#}"), "status report not written");
        }
    }

    /// Graceful shutdown. Idempotent; concurrent callers wait for the
    /// first one to finish.
    pub async fn shutdown(&self) {
        let mut stopped = self.stopped.lock().await;
        if *stopped {
            return;
        }
        info!(phase = ?self.lifecycle.phase(), "shutting down");

        if let Some(tasks) = self.tasks.lock().await.take() {
            tasks.shutdown(TASK_STOP_TIMEOUT).await;
        }
        self.lifecycle.begin_shutdown();

        let grace = self.config.supervisor.shutdown_grace();
        match tokio::time::timeout(grace + TASK_STOP_TIMEOUT, self.supervisor.shutdown(grace)).await {
            Ok(Ok(())) => info!("worker pool stopped"),
            Ok(Err(e)) => error!(error = %e, "worker pool shutdown failed"),
            Err(_) => error!("worker pool did not stop in time"),
        }
        if let Some(task) = self.supervisor_task.lock().await.take()
            && let Err(e) = task.await
        {
            error!(error = %e, "supervisor task failed");
        }

        if let Some(report) = self.alerts.flush().await {
            info!(delivered = report.delivered.len(), "pending alerts flushed");
        }
        self.lifecycle.mark_stopped();
        self.write_status().await;
        *stopped = true;
        info!("shutdown complete");
    }

    /// Ask the main loop to shut down.
    pub fn request_shutdown(&self) {
        self.shutdown_request.request();
    }

    /// Resolves once something asked for shutdown.
    pub async fn shutdown_requested(&self) {
        self.shutdown_request.wait().await;
    }

    /// Exit code the process should end with.
    pub fn exit_code(&self) -> i32 {
        self.shutdown_request.exit_code()
    }

    pub fn phase(&self) -> SystemPhase {
        self.lifecycle.phase()
    }

    pub fn supervisor(&self) -> &SupervisorHandle {
        &self.supervisor
    }

    pub fn ladder(&self) -> &Arc<ErrorLadder> {
        &self.ladder
    }

    pub fn alerts(&self) -> &Arc<AlertManager> {
        &self.alerts
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn rollout(&self) -> &Arc<RolloutController> {
        &self.rollout
    }

    pub fn metrics(&self) -> &Arc<PoolMetrics> {
        &self.metrics
    }
}
