use std::fmt;

use serde::{Deserialize, Serialize};

/// Failure classes counted by the ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Worker exited unexpectedly.
    WorkerCrash,
    /// Error reported by a running worker.
    WorkerError,
    /// A slot ran out of restarts.
    RestartLimitExceeded,
    /// Overall health tick came back unhealthy.
    HealthCheckFailed,
    /// Rollout health gate failed.
    DeploymentFailed,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::WorkerCrash => "worker_crash",
            ErrorKind::WorkerError => "worker_error",
            ErrorKind::RestartLimitExceeded => "restart_limit_exceeded",
            ErrorKind::HealthCheckFailed => "health_check_failed",
            ErrorKind::DeploymentFailed => "deployment_failed",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    /// Epoch milliseconds.
    pub timestamp: u64,
}

impl ErrorRecord {
    pub fn new(kind: ErrorKind, message: impl Into<String>, timestamp: u64) -> Self {
        Self {
            kind,
            message: message.into(),
            timestamp,
        }
    }
}
