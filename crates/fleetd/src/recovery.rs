//! Recovery actions the escalation ladder can take on the running daemon.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use tokio::sync::watch;
use tracing::{info, warn};

use fleet_alert::{Alert, AlertManager};
use fleet_core::{BoxFuture, Severity, SharedClock};
use fleet_escalation::RecoveryActions;
use fleet_rollout::{DeployOptions, RolloutController};
use fleet_supervisor::SupervisorHandle;

/// Rule id carried by alerts the ladder raises.
pub const ESCALATION_ALERT_ID: &str = "error_escalation";

/// Shared between the daemon and its recovery actions: a shutdown request
/// flag and the exit code the process should end with.
#[derive(Clone)]
pub struct ShutdownRequest {
    requested: Arc<watch::Sender<bool>>,
    exit_code: Arc<AtomicI32>,
}

impl ShutdownRequest {
    pub fn new() -> Self {
        let (requested, _) = watch::channel(false);
        Self {
            requested: Arc::new(requested),
            exit_code: Arc::new(AtomicI32::new(0)),
        }
    }

    pub fn request(&self) {
        self.requested.send_replace(true);
    }

    pub fn is_requested(&self) -> bool {
        *self.requested.borrow()
    }

    /// Resolves once shutdown has been requested.
    pub async fn wait(&self) {
        let mut rx = self.requested.subscribe();
        let _ = rx.wait_for(|requested| *requested).await;
    }

    pub fn set_exit_code(&self, code: i32) {
        self.exit_code.store(code, Ordering::SeqCst);
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::SeqCst)
    }
}

impl Default for ShutdownRequest {
    fn default() -> Self {
        Self::new()
    }
}

pub struct FleetRecovery {
    supervisor: SupervisorHandle,
    alerts: Arc<AlertManager>,
    rollout: Arc<RolloutController>,
    deploy_options: DeployOptions,
    shutdown: ShutdownRequest,
    clock: SharedClock,
}

impl FleetRecovery {
    pub fn new(
        supervisor: SupervisorHandle,
        alerts: Arc<AlertManager>,
        rollout: Arc<RolloutController>,
        deploy_options: DeployOptions,
        shutdown: ShutdownRequest,
        clock: SharedClock,
    ) -> Self {
        Self {
            supervisor,
            alerts,
            rollout,
            deploy_options,
            shutdown,
            clock,
        }
    }
}

impl RecoveryActions for FleetRecovery {
    fn alert(&self, severity: Severity, message: String) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let alert = Alert::raised(ESCALATION_ALERT_ID, severity, message, self.clock.now_millis());
            if let Some(report) = self.alerts.raise(alert).await
                && !report.all_delivered()
            {
                warn!(failed = report.failed.len(), "escalation alert not fully delivered");
            }
        })
    }

    fn restart(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            let restarted = self.supervisor.restart_all().await?;
            info!(restarted, "worker pool restarted");
            Ok(())
        })
    }

    fn rollback(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            let version = self.rollout.rollback(&self.deploy_options).await?;
            info!(%version, "rolled back");
            Ok(())
        })
    }

    // The daemon runs the shutdown sequence; this only asks for it, so the
    // ladder is never waiting on the task that is being cancelled.
    fn shutdown(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.shutdown.request();
        })
    }

    fn terminate(&self, code: i32) {
        self.shutdown.set_exit_code(code);
        self.shutdown.request();
    }
}
