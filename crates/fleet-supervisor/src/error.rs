use fleet_core::SlotId;
use thiserror::Error;

pub type SupervisorResult<T> = Result<T, SupervisorError>;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("supervisor is not accepting new work")]
    NotRunning,

    #[error("supervisor task has stopped")]
    Closed,

    #[error("no worker in slot {0}")]
    UnknownSlot(SlotId),

    #[error("pool bounds reached: {0}")]
    Capacity(String),

    #[error("failed to spawn worker for slot {slot}: {reason}")]
    Spawn { slot: SlotId, reason: String },

    #[error("spawning slot {0} timed out")]
    SpawnTimeout(SlotId),

    #[error("runtime: {0}")]
    Runtime(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
