//! fleet-supervisor — owns the worker pool.
//!
//! The pool is an actor: one task owns every `WorkerRecord` and processes
//! commands and worker events strictly one at a time. Everything else talks
//! to it through a cloneable [`SupervisorHandle`].
//!
//! ```text
//! SupervisorHandle ──cmd + oneshot──▶ Supervisor task ◀──WorkerEvent── WorkerRuntime
//!                                       │  workers: slot → WorkerRecord
//!                                       │  windows: slot → RestartWindow
//!                                       └──SupervisorNotice──▶ daemon (escalation)
//! ```
//!
//! Crash handling: an unexpected exit is reported, the slot's restart window
//! is pruned, and the slot is restarted after `restart_delay` only while the
//! window holds fewer than `max_restarts` entries. Otherwise the slot is
//! retired and `RestartLimitExceeded` is raised.

pub mod error;
pub mod process;
pub mod runtime;
pub mod supervisor;
pub mod worker;

pub use error::{SupervisorError, SupervisorResult};
pub use process::ProcessRuntime;
pub use runtime::{
    EventSender, SpawnSpec, WorkerCommand, WorkerEvent, WorkerEventKind, WorkerHandle, WorkerRuntime,
};
pub use supervisor::{PoolStatus, Supervisor, SupervisorHandle, SupervisorNotice, SupervisorSettings};
pub use worker::{MetricsUpdate, RestartWindow, WorkerMetrics, WorkerRecord, WorkerStatus};
