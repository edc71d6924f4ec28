//! fleet-autoscale — load-driven pool scaling.
//!
//! Reads CPU and memory load from a `MetricsSource`, compares them with the
//! configured thresholds and asks a `ScaleTarget` to add or remove workers.
//!
//! # Scaling Algorithm
//!
//! ```text
//! if now < cooldown_until:            hold
//!
//! if current < max and (cpu > up_cpu or memory > up_memory):
//!     scale up by min(step, max - current)
//!
//! if current > min and cpu < down_cpu and memory < down_memory:
//!     scale down by min(step, current - min)
//!
//! after any action: cooldown_until = now + cooldown
//! ```
//!
//! One action per evaluation. The cooldown is armed even when the action
//! fails, so a broken pool is not hammered every interval.

pub mod scaler;

pub use scaler::{
    Autoscaler, LastAction, Load, ScaleDecision, ScaleTarget, ScaledEvent, ScalingLimits,
    ScalingState,
};
