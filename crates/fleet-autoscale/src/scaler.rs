//! Autoscaler — the control loop and its pure decision function.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};

use fleet_core::config::AutoscaleConfig;
use fleet_core::{
    BoxFuture, Lifecycle, MetricsSnapshot, MetricsSource, ScaleDirection, SharedClock,
};

/// Whatever owns the pool being scaled.
pub trait ScaleTarget: Send + Sync {
    /// Workers currently counted toward capacity.
    fn live_workers(&self) -> BoxFuture<'_, anyhow::Result<u32>>;

    /// Add or remove `count` workers. Returns the resulting live count.
    fn scale(&self, direction: ScaleDirection, count: u32) -> BoxFuture<'_, anyhow::Result<u32>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalingLimits {
    pub min_workers: u32,
    pub max_workers: u32,
}

/// Load figures read from one snapshot. A missing figure never triggers
/// a scale-up and always blocks a scale-down.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Load {
    pub cpu: Option<f64>,
    pub memory: Option<f64>,
}

impl Load {
    pub fn from_snapshot(snapshot: &MetricsSnapshot, cpu_metric: &str, memory_metric: &str) -> Self {
        Self {
            cpu: snapshot.number(cpu_metric),
            memory: snapshot.number(memory_metric),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    Up(u32),
    Down(u32),
    NoChange,
    /// Skipped: still inside the cooldown window.
    Cooldown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LastAction {
    pub direction: ScaleDirection,
    /// Epoch milliseconds.
    pub at: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScalingState {
    pub current_workers: u32,
    pub last_action: Option<LastAction>,
    /// Epoch milliseconds; no action while `now` is below it.
    pub cooldown_until: u64,
}

/// Broadcast after every successful scaling action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaledEvent {
    pub direction: ScaleDirection,
    pub workers: u32,
    pub at: u64,
}

pub struct Autoscaler {
    config: AutoscaleConfig,
    limits: ScalingLimits,
    metrics: Arc<dyn MetricsSource>,
    target: Arc<dyn ScaleTarget>,
    lifecycle: Lifecycle,
    clock: SharedClock,
    /// Held for a whole tick so evaluations never interleave.
    state: Mutex<ScalingState>,
    events: broadcast::Sender<ScaledEvent>,
}

impl Autoscaler {
    pub fn new(
        config: AutoscaleConfig,
        limits: ScalingLimits,
        metrics: Arc<dyn MetricsSource>,
        target: Arc<dyn ScaleTarget>,
        lifecycle: Lifecycle,
        clock: SharedClock,
    ) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            config,
            limits,
            metrics,
            target,
            lifecycle,
            clock,
            state: Mutex::new(ScalingState::default()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScaledEvent> {
        self.events.subscribe()
    }

    pub fn interval(&self) -> Duration {
        self.config.interval()
    }

    pub async fn state(&self) -> ScalingState {
        self.state.lock().await.clone()
    }

    /// Decide what to do for `load` at `current` workers, ignoring cooldown.
    pub fn decide(&self, load: Load, current: u32) -> ScaleDecision {
        let cfg = &self.config;
        let above = |v: Option<f64>, limit: f64| v.is_some_and(|v| v > limit);
        let below = |v: Option<f64>, limit: f64| v.is_some_and(|v| v < limit);

        if current < self.limits.max_workers
            && (above(load.cpu, cfg.scale_up_cpu) || above(load.memory, cfg.scale_up_memory))
        {
            let count = cfg.step.max(1).min(self.limits.max_workers - current);
            return ScaleDecision::Up(count);
        }

        if current > self.limits.min_workers
            && below(load.cpu, cfg.scale_down_cpu)
            && below(load.memory, cfg.scale_down_memory)
        {
            let count = cfg.step.max(1).min(current - self.limits.min_workers);
            return ScaleDecision::Down(count);
        }

        ScaleDecision::NoChange
    }

    /// One evaluation: read load, decide, act, arm the cooldown.
    pub async fn tick(&self) -> ScaleDecision {
        if !self.lifecycle.is_running() {
            return ScaleDecision::NoChange;
        }

        let mut state = self.state.lock().await;
        let now = self.clock.now_millis();
        if now < state.cooldown_until {
            debug!(remaining_ms = state.cooldown_until - now, "autoscaler in cooldown");
            return ScaleDecision::Cooldown;
        }

        let snapshot = self.metrics.snapshot().await;
        let load = Load::from_snapshot(&snapshot, &self.config.cpu_metric, &self.config.memory_metric);
        let current = match self.target.live_workers().await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "could not read pool size");
                return ScaleDecision::NoChange;
            }
        };
        state.current_workers = current;

        let decision = self.decide(load, current);
        let (direction, count) = match decision {
            ScaleDecision::Up(n) => (ScaleDirection::Up, n),
            ScaleDecision::Down(n) => (ScaleDirection::Down, n),
            ScaleDecision::NoChange | ScaleDecision::Cooldown => {
                debug!(current, cpu = ?load.cpu, memory = ?load.memory, "no scaling needed");
                return decision;
            }
        };

        info!(
            %direction,
            count,
            from = current,
            cpu = ?load.cpu,
            memory = ?load.memory,
            "scaling"
        );
        state.last_action = Some(LastAction { direction, at: now });
        state.cooldown_until = now + self.config.cooldown().as_millis() as u64;

        match self.target.scale(direction, count).await {
            Ok(workers) => {
                state.current_workers = workers;
                let _ = self.events.send(ScaledEvent {
                    direction,
                    workers,
                    at: now,
                });
            }
            Err(e) => warn!(%direction, count, error = %e, "scaling action failed"),
        }
        decision
    }
}
