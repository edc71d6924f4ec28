//! fleetd — the FleetGrid daemon.
//!
//! Assembles every FleetGrid subsystem around one worker pool:
//! - Worker supervisor (process runtime)
//! - Health monitor with the configured probes
//! - Alert engine and notification dispatcher
//! - Error escalation ladder
//! - Autoscaler
//! - Rollout controller
//!
//! ```text
//! metrics tick ──▶ PoolMetrics ──▶ AlertManager ──▶ transports
//!                             └──▶ Autoscaler ──▶ supervisor
//! health tick  ──▶ HealthMonitor ──unhealthy──▶ ErrorLadder
//! supervisor notices ──crash / restart limit──▶ ErrorLadder ──▶ FleetRecovery
//! SIGHUP ──▶ reload ──new version──▶ RolloutController
//! ```

pub mod daemon;
pub mod metrics;
pub mod pool;
pub mod probes;
pub mod recovery;
pub mod status;

pub use daemon::Daemon;
pub use metrics::PoolMetrics;
pub use pool::Pool;
pub use recovery::FleetRecovery;
pub use status::StatusReport;
