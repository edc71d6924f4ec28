//! The seam between the supervisor and whatever actually runs workers.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use fleet_core::{BoxFuture, HealthStatus, SlotId};

use crate::error::SupervisorResult;
use crate::worker::MetricsUpdate;

/// Runtime-assigned identity of one worker incarnation (a pid for
/// processes). A restarted slot gets a new handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerHandle(pub u64);

impl fmt::Display for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerCommand {
    /// Finish in-flight work and exit.
    Disconnect,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpawnSpec {
    pub slot: SlotId,
    pub version: String,
    pub env: HashMap<String, String>,
}

/// Message from a worker, tagged with where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerEvent {
    pub slot: SlotId,
    pub handle: WorkerHandle,
    pub kind: WorkerEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEventKind {
    Online,
    Metrics(MetricsUpdate),
    Error { message: String },
    Health { status: HealthStatus },
    Exited { code: Option<i32>, signal: Option<i32> },
}

pub type EventSender = mpsc::UnboundedSender<WorkerEvent>;

pub trait WorkerRuntime: Send + Sync {
    /// Start one worker. Every message it produces, including its exit,
    /// must be sent on `events`.
    fn spawn(&self, spec: SpawnSpec, events: EventSender) -> BoxFuture<'_, SupervisorResult<WorkerHandle>>;

    fn signal(&self, handle: WorkerHandle, command: WorkerCommand) -> BoxFuture<'_, SupervisorResult<()>>;

    /// Kill without waiting for cooperation.
    fn terminate(&self, handle: WorkerHandle) -> BoxFuture<'_, SupervisorResult<()>>;
}
