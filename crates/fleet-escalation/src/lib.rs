//! fleet-escalation — turns accumulated failures into recovery actions.
//!
//! ```text
//! record(kind, message)
//!   ├── total += 1, by_kind[kind] += 1, recent ring (oldest evicted)
//!   └── rung for the new total
//!         ≥ warning   → warning alert
//!         ≥ critical  → restart, rollback if restart fails
//!         ≥ fatal     → mark failed, graceful shutdown, exit non-zero (once)
//! ```
//!
//! Counters only go down through an explicit `reset()`.

pub mod ladder;
pub mod record;

pub use ladder::{ErrorLadder, LadderStatus, RecoveryActions, Rung, Thresholds};
pub use record::{ErrorKind, ErrorRecord};
