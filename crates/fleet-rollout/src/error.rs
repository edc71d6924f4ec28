use std::fmt;

use thiserror::Error;

use crate::strategy::RolloutStrategy;

pub type RolloutResult<T> = Result<T, RolloutError>;

/// What happened to the previous version after a failed gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackOutcome {
    /// `rollback_on_failure` was off.
    Disabled,
    RolledBack { version: String },
    Failed { version: String, reason: String },
}

impl fmt::Display for RollbackOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollbackOutcome::Disabled => f.write_str("rollback disabled"),
            RollbackOutcome::RolledBack { version } => write!(f, "rolled back to {version}"),
            RollbackOutcome::Failed { version, reason } => {
                write!(f, "rollback to {version} failed: {reason}")
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("{0} rollouts are not supported")]
    Unsupported(RolloutStrategy),

    #[error("a rollout is already in progress")]
    InProgress,

    #[error("system is not running")]
    NotRunning,

    #[error("no previous version in history")]
    NoHistory,

    #[error("rollout target: {0}")]
    Target(String),

    #[error("deploy of {version} failed health gate at batch {batch}/{batches}; {rollback}")]
    HealthGate {
        version: String,
        batch: usize,
        batches: usize,
        rollback: RollbackOutcome,
    },
}

impl RolloutError {
    pub(crate) fn target(e: anyhow::Error) -> Self {
        RolloutError::Target(format!("{e:#}"))
    }
}
