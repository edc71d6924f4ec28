//! fleet-rollout — versioned, batched rolling deploys.
//!
//! # Components
//!
//! - **`strategy`** — rollout strategies, deploy options and batch partitioning
//! - **`controller`** — deployment state, the rolling procedure, rollback
//!
//! ```text
//! deploy(v2)
//!   ├── history.push_front(v1), trim; state.version = v2
//!   ├── for batch in partition(live workers, batches):
//!   │     replace each worker (settle delay between)
//!   │     soak, then one health tick
//!   │     unhealthy → stop
//!   └── on failure with rollback_on_failure:
//!         state.version = v1, re-run the rolling procedure with v1
//!         (the deploy is still reported as failed)
//! ```

pub mod controller;
pub mod error;
pub mod strategy;

pub use controller::{
    DeployReport, DeploymentState, HealthGate, HistoryEntry, RolloutController, RolloutTarget,
};
pub use error::{RollbackOutcome, RolloutError, RolloutResult};
pub use strategy::{DeployOptions, RolloutStrategy, partition};
