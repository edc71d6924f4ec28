//! fleet-health — health monitoring for the FleetGrid supervisor.
//!
//! Runs every registered probe concurrently on each tick, races each one
//! against a fixed timeout, and folds the results into one overall status
//! (worst-of: `unhealthy > degraded > healthy`).
//!
//! # Architecture
//!
//! ```text
//! HealthMonitor
//!   ├── Registered probes (name → Arc<dyn Probe> + optional Remediation)
//!   ├── tick()
//!   │   ├── run_probe() per probe, joined concurrently
//!   │   ├── aggregate() → overall HealthStatus
//!   │   └── on unhealthy: remediation hooks / open circuit breakers
//!   ├── BreakerRegistry (resource → CircuitBreaker)
//!   └── broadcast of HealthEvent on overall status change
//! ```
//!
//! A timed-out or failing probe is recorded as `unhealthy` with the error
//! message. It never delays the other probes beyond the shared timeout.

pub mod breaker;
pub mod checker;
pub mod monitor;

pub use breaker::{BreakerRegistry, CircuitBreaker, CircuitBreakerRecord, SimpleBreaker};
pub use checker::{FnProbe, HealthCheckResult, HttpProbe, Probe, ProbeOutcome, run_probe};
pub use monitor::{HealthEvent, HealthMonitor, HealthReport, Remediation, RemediationHook, aggregate};
