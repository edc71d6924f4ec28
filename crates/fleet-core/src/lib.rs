//! fleet-core — shared types for the FleetGrid supervision engine.
//!
//! Everything the component crates agree on lives here:
//!
//! - **`config`** — `fleet.toml` parsing, per-section defaults and validation
//! - **`types`** — severities, health status, comparison operators
//! - **`metrics`** — flat, dot-path addressable metric snapshots
//! - **`clock`** — injectable wall clock (system or manual)
//! - **`lifecycle`** — shared running / shutting-down phase
//! - **`ticker`** — cancellable periodic tasks
//! - **`target`** — plain HTTP URLs split for dialing
//!
//! # Architecture
//!
//! ```text
//! fleetd
//!   ├── fleet-supervisor  (worker pool actor)
//!   ├── fleet-autoscale   (scale loop)      ──┐
//!   ├── fleet-health      (probe loop)        │ all depend on fleet-core
//!   ├── fleet-alert       (rules + dispatch)  │
//!   ├── fleet-escalation  (error ladder)      │
//!   └── fleet-rollout     (rolling deploys) ──┘
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod target;
pub mod ticker;
pub mod types;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock, system_clock};
pub use config::{FleetConfig, parse_duration};
pub use error::{ConfigError, ConfigResult, UrlError};
pub use lifecycle::{Lifecycle, SystemPhase};
pub use metrics::{MetricValue, MetricsSnapshot, MetricsSource};
pub use target::HttpTarget;
pub use ticker::TaskSet;
pub use types::*;
