//! The pool actor and its handle.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use fleet_core::config::SupervisorConfig;
use fleet_core::{Lifecycle, SharedClock, SlotId};

use crate::error::{SupervisorError, SupervisorResult};
use crate::runtime::{
    EventSender, SpawnSpec, WorkerCommand, WorkerEvent, WorkerEventKind, WorkerHandle,
    WorkerRuntime,
};
use crate::worker::{RestartWindow, WorkerRecord, WorkerStatus};

pub const SLOT_ENV: &str = "FLEET_WORKER_SLOT";
pub const VERSION_ENV: &str = "FLEET_VERSION";

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub min_workers: u32,
    pub max_workers: u32,
    pub max_restarts: u32,
    pub restart_window: Duration,
    pub restart_delay: Duration,
    /// Default grace for disconnects not given an explicit one.
    pub shutdown_grace: Duration,
    /// Bound on a single runtime call (spawn, signal, terminate).
    pub runtime_timeout: Duration,
    pub env: HashMap<String, String>,
    pub version: String,
}

impl SupervisorSettings {
    pub fn from_config(cfg: &SupervisorConfig, version: &str) -> Self {
        Self {
            min_workers: cfg.min_workers,
            max_workers: cfg.max_workers,
            max_restarts: cfg.max_restarts,
            restart_window: cfg.restart_window(),
            restart_delay: cfg.restart_delay(),
            shutdown_grace: cfg.shutdown_grace(),
            runtime_timeout: Duration::from_secs(10),
            env: cfg.env.clone(),
            version: version.to_string(),
        }
    }
}

/// Things the rest of the system needs to hear about.
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorNotice {
    WorkerCrashed {
        slot: SlotId,
        handle: WorkerHandle,
        code: Option<i32>,
        signal: Option<i32>,
    },
    RestartScheduled {
        slot: SlotId,
        attempt: usize,
        delay: Duration,
    },
    WorkerRestarted {
        slot: SlotId,
        handle: WorkerHandle,
    },
    /// The slot is retired; it will not be restarted.
    RestartLimitExceeded { slot: SlotId, restarts: usize },
    WorkerError { slot: SlotId, message: String },
    CapacityChanged { live: usize },
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub version: String,
    pub min_workers: u32,
    pub max_workers: u32,
    pub live: usize,
    pub online: usize,
    pub draining: usize,
    pub pending_restarts: Vec<SlotId>,
    pub retired_slots: Vec<SlotId>,
    pub workers: Vec<WorkerRecord>,
}

impl PoolStatus {
    fn live_workers(&self) -> impl Iterator<Item = &WorkerRecord> {
        self.workers.iter().filter(|w| w.status.is_live())
    }

    fn average(&self, f: impl Fn(&WorkerRecord) -> f64) -> f64 {
        let values: Vec<f64> = self.live_workers().map(f).collect();
        if values.is_empty() {
            0.0
        } else {
            values.iter().sum::<f64>() / values.len() as f64
        }
    }

    pub fn avg_cpu(&self) -> f64 {
        self.average(|w| w.metrics.cpu)
    }

    pub fn avg_memory(&self) -> f64 {
        self.average(|w| w.metrics.memory)
    }

    pub fn total_requests(&self) -> u64 {
        self.workers.iter().map(|w| w.metrics.requests).sum()
    }

    pub fn total_errors(&self) -> u64 {
        self.workers.iter().map(|w| w.metrics.errors).sum()
    }

    /// Live worker with the highest resident memory.
    pub fn heaviest(&self) -> Option<&WorkerRecord> {
        self.live_workers()
            .max_by(|a, b| a.metrics.memory.total_cmp(&b.metrics.memory))
    }
}

type Reply<T> = oneshot::Sender<SupervisorResult<T>>;

enum Command {
    Start { count: u32, reply: Reply<Vec<SlotId>> },
    ScaleUp { count: u32, reply: Reply<Vec<SlotId>> },
    ScaleDown { count: u32, reply: Reply<Vec<SlotId>> },
    Stop { slot: SlotId, grace: Duration, reply: Reply<()> },
    Replace { slot: SlotId, reply: Reply<WorkerHandle> },
    SetVersion { version: String, reply: oneshot::Sender<()> },
    Status { reply: oneshot::Sender<PoolStatus> },
    Shutdown { grace: Duration, reply: oneshot::Sender<()> },
    RestartDue { slot: SlotId },
    ForceKill { slot: SlotId, handle: WorkerHandle },
}

/// Who is waiting for a slot's current worker to exit.
enum ExitWaiter {
    Stop(Reply<()>),
    Replace(Reply<WorkerHandle>),
}

pub struct Supervisor {
    settings: SupervisorSettings,
    runtime: Arc<dyn WorkerRuntime>,
    lifecycle: Lifecycle,
    clock: SharedClock,

    workers: BTreeMap<SlotId, WorkerRecord>,
    windows: HashMap<SlotId, RestartWindow>,
    pending_restarts: BTreeSet<SlotId>,
    retired: BTreeSet<SlotId>,
    waiters: HashMap<SlotId, Vec<ExitWaiter>>,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
    shutting_down: bool,
    last_live: usize,

    commands: mpsc::Receiver<Command>,
    self_tx: mpsc::WeakSender<Command>,
    events_tx: EventSender,
    events_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    notices: mpsc::UnboundedSender<SupervisorNotice>,
}

impl Supervisor {
    /// Start the actor. Returns its handle, the notice stream and the task.
    pub fn spawn(
        settings: SupervisorSettings,
        runtime: Arc<dyn WorkerRuntime>,
        lifecycle: Lifecycle,
        clock: SharedClock,
    ) -> (
        SupervisorHandle,
        mpsc::UnboundedReceiver<SupervisorNotice>,
        JoinHandle<()>,
    ) {
        let (tx, commands) = mpsc::channel(64);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (notices, notice_rx) = mpsc::unbounded_channel();

        let handle = SupervisorHandle {
            tx: tx.clone(),
            default_grace: settings.shutdown_grace,
        };
        let actor = Self {
            settings,
            runtime,
            lifecycle,
            clock,
            workers: BTreeMap::new(),
            windows: HashMap::new(),
            pending_restarts: BTreeSet::new(),
            retired: BTreeSet::new(),
            waiters: HashMap::new(),
            shutdown_waiters: Vec::new(),
            shutting_down: false,
            last_live: 0,
            commands,
            self_tx: tx.downgrade(),
            events_tx,
            events_rx,
            notices,
        };
        let task = tokio::spawn(actor.run());
        (handle, notice_rx, task)
    }

    async fn run(mut self) {
        info!(version = %self.settings.version, "supervisor started");
        loop {
            // Pending worker events are drained before the next command so
            // every command sees the latest pool state.
            tokio::select! {
                biased;
                Some(event) = self.events_rx.recv() => self.handle_event(event).await,
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
            }

            if self.shutting_down && self.workers.is_empty() {
                for waiter in self.shutdown_waiters.drain(..) {
                    let _ = waiter.send(());
                }
                break;
            }
        }
        info!("supervisor stopped");
    }

    fn notify(&self, notice: SupervisorNotice) {
        let _ = self.notices.send(notice);
    }

    fn live(&self) -> usize {
        self.workers.values().filter(|w| w.status.is_live()).count()
    }

    fn note_capacity(&mut self) {
        let live = self.live();
        if live != self.last_live {
            self.last_live = live;
            debug!(live, "pool capacity changed");
            self.notify(SupervisorNotice::CapacityChanged { live });
        }
    }

    fn accepting(&self) -> SupervisorResult<()> {
        if self.shutting_down || !self.lifecycle.is_running() {
            Err(SupervisorError::NotRunning)
        } else {
            Ok(())
        }
    }

    /// Lowest slot ids that are free and not retired.
    fn free_slots(&self, n: usize) -> Vec<SlotId> {
        (0..)
            .filter(|s| {
                !self.workers.contains_key(s)
                    && !self.pending_restarts.contains(s)
                    && !self.retired.contains(s)
            })
            .take(n)
            .collect()
    }

    fn status(&self) -> PoolStatus {
        PoolStatus {
            version: self.settings.version.clone(),
            min_workers: self.settings.min_workers,
            max_workers: self.settings.max_workers,
            live: self.live(),
            online: self
                .workers
                .values()
                .filter(|w| w.status == WorkerStatus::Online)
                .count(),
            draining: self
                .workers
                .values()
                .filter(|w| w.status == WorkerStatus::Draining)
                .count(),
            pending_restarts: self.pending_restarts.iter().copied().collect(),
            retired_slots: self.retired.iter().copied().collect(),
            workers: self.workers.values().cloned().collect(),
        }
    }

    // ── Commands ─────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start { count, reply } => {
                let result = self.grow(count, false).await;
                let _ = reply.send(result);
            }
            Command::ScaleUp { count, reply } => {
                let result = self.grow(count, true).await;
                let _ = reply.send(result);
            }
            Command::ScaleDown { count, reply } => {
                let result = self.shrink(count).await;
                let _ = reply.send(result);
            }
            Command::Stop { slot, grace, reply } => {
                let Some(status) = self.workers.get(&slot).map(|w| w.status) else {
                    let _ = reply.send(Err(SupervisorError::UnknownSlot(slot)));
                    return;
                };
                if status != WorkerStatus::Draining {
                    self.drain(slot, grace).await;
                }
                self.waiters
                    .entry(slot)
                    .or_default()
                    .push(ExitWaiter::Stop(reply));
            }
            Command::Replace { slot, reply } => {
                if let Err(e) = self.accepting() {
                    let _ = reply.send(Err(e));
                    return;
                }
                let Some(status) = self.workers.get(&slot).map(|w| w.status) else {
                    let _ = reply.send(Err(SupervisorError::UnknownSlot(slot)));
                    return;
                };
                if status != WorkerStatus::Draining {
                    self.drain(slot, self.settings.shutdown_grace).await;
                }
                self.waiters
                    .entry(slot)
                    .or_default()
                    .push(ExitWaiter::Replace(reply));
            }
            Command::SetVersion { version, reply } => {
                info!(from = %self.settings.version, to = %version, "worker version set");
                self.settings.version = version;
                let _ = reply.send(());
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::Shutdown { grace, reply } => {
                if !self.shutting_down {
                    self.shutting_down = true;
                    self.pending_restarts.clear();
                    info!(workers = self.workers.len(), grace_ms = grace.as_millis() as u64, "draining pool");
                    let slots: Vec<SlotId> = self
                        .workers
                        .values()
                        .filter(|w| w.status != WorkerStatus::Draining)
                        .map(|w| w.slot)
                        .collect();
                    for slot in slots {
                        self.drain(slot, grace).await;
                    }
                }
                self.shutdown_waiters.push(reply);
            }
            Command::RestartDue { slot } => self.restart_due(slot).await,
            Command::ForceKill { slot, handle } => self.force_kill(slot, handle).await,
        }
    }

    async fn grow(&mut self, count: u32, strict: bool) -> SupervisorResult<Vec<SlotId>> {
        self.accepting()?;
        // Slots waiting out their restart delay still hold capacity.
        let room = (self.settings.max_workers as usize)
            .saturating_sub(self.live() + self.pending_restarts.len());
        let n = (count as usize).min(room);
        if n == 0 && strict {
            return Err(SupervisorError::Capacity(format!(
                "already at max_workers ({})",
                self.settings.max_workers
            )));
        }

        let mut started = Vec::with_capacity(n);
        let mut last_err = None;
        for slot in self.free_slots(n) {
            match self.spawn_slot(slot).await {
                Ok(_) => started.push(slot),
                Err(e) => {
                    error!(slot, error = %e, "failed to start worker");
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) if started.is_empty() => Err(e),
            _ => Ok(started),
        }
    }

    /// Disconnect the `count` least-used workers, never going below the
    /// minimum. Fewest lifetime requests first, lowest slot on ties.
    async fn shrink(&mut self, count: u32) -> SupervisorResult<Vec<SlotId>> {
        self.accepting()?;
        let removable = self
            .live()
            .saturating_sub(self.settings.min_workers as usize);
        let n = (count as usize).min(removable);
        if n == 0 {
            return Err(SupervisorError::Capacity(format!(
                "already at min_workers ({})",
                self.settings.min_workers
            )));
        }

        let mut candidates: Vec<(u64, SlotId)> = self
            .workers
            .values()
            .filter(|w| w.status.is_live())
            .map(|w| (w.metrics.requests, w.slot))
            .collect();
        candidates.sort();

        let chosen: Vec<SlotId> = candidates.into_iter().take(n).map(|(_, s)| s).collect();
        for &slot in &chosen {
            self.drain(slot, self.settings.shutdown_grace).await;
        }
        Ok(chosen)
    }

    async fn spawn_slot(&mut self, slot: SlotId) -> SupervisorResult<WorkerHandle> {
        let mut env = self.settings.env.clone();
        env.insert(SLOT_ENV.to_string(), slot.to_string());
        env.insert(VERSION_ENV.to_string(), self.settings.version.clone());
        let spec = SpawnSpec {
            slot,
            version: self.settings.version.clone(),
            env,
        };

        let spawn = self.runtime.spawn(spec, self.events_tx.clone());
        let handle = match tokio::time::timeout(self.settings.runtime_timeout, spawn).await {
            Ok(result) => result?,
            Err(_) => return Err(SupervisorError::SpawnTimeout(slot)),
        };

        let now = self.clock.now_millis();
        let record = WorkerRecord::new(slot, handle, &self.settings.version, now);
        info!(slot, handle = %handle, version = %record.version, "worker started");
        self.workers.insert(slot, record);
        self.note_capacity();
        Ok(handle)
    }

    /// Ask a worker to disconnect and arm the force-kill timer.
    async fn drain(&mut self, slot: SlotId, grace: Duration) {
        let Some(record) = self.workers.get_mut(&slot) else {
            return;
        };
        record.status = WorkerStatus::Draining;
        let handle = record.handle;
        debug!(slot, handle = %handle, "disconnecting worker");

        let signal = self.runtime.signal(handle, WorkerCommand::Disconnect);
        match tokio::time::timeout(self.settings.runtime_timeout, signal).await {
            Ok(Ok(())) => {
                let tx = self.self_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    if let Some(tx) = tx.upgrade() {
                        let _ = tx.send(Command::ForceKill { slot, handle }).await;
                    }
                });
            }
            Ok(Err(e)) => {
                warn!(slot, error = %e, "disconnect failed, terminating");
                self.terminate(slot, handle).await;
            }
            Err(_) => {
                warn!(slot, "disconnect timed out, terminating");
                self.terminate(slot, handle).await;
            }
        }
        self.note_capacity();
    }

    async fn terminate(&self, slot: SlotId, handle: WorkerHandle) {
        let kill = self.runtime.terminate(handle);
        match tokio::time::timeout(self.settings.runtime_timeout, kill).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(slot, handle = %handle, error = %e, "terminate failed"),
            Err(_) => error!(slot, handle = %handle, "terminate timed out"),
        }
    }

    async fn force_kill(&mut self, slot: SlotId, handle: WorkerHandle) {
        let still_draining = self
            .workers
            .get(&slot)
            .is_some_and(|w| w.handle == handle && w.status == WorkerStatus::Draining);
        if still_draining {
            warn!(slot, handle = %handle, "worker ignored disconnect, killing");
            self.terminate(slot, handle).await;
        }
    }

    async fn restart_due(&mut self, slot: SlotId) {
        if !self.pending_restarts.remove(&slot) {
            return;
        }
        if self.accepting().is_err() {
            info!(slot, "restart dropped, supervisor is stopping");
            return;
        }
        if self.live() >= self.settings.max_workers as usize {
            warn!(slot, live = self.live(), "restart dropped, pool is at max_workers");
            return;
        }
        match self.spawn_slot(slot).await {
            Ok(handle) => {
                info!(slot, handle = %handle, "worker restarted");
                self.notify(SupervisorNotice::WorkerRestarted { slot, handle });
            }
            Err(e) => {
                error!(slot, error = %e, "restart failed");
                self.notify(SupervisorNotice::WorkerError {
                    slot,
                    message: format!("restart failed: {e}"),
                });
                self.restart_or_retire(slot);
            }
        }
    }

    /// Admit the slot into its restart window or retire it.
    fn restart_or_retire(&mut self, slot: SlotId) {
        if self.accepting().is_err() {
            info!(slot, "not restarting, supervisor is stopping");
            return;
        }

        let now = self.clock.now_millis();
        let window = self
            .windows
            .entry(slot)
            .or_insert_with(|| RestartWindow::new(self.settings.restart_window));

        if window.try_admit(now, self.settings.max_restarts) {
            let attempt = window.len();
            let delay = self.settings.restart_delay;
            info!(slot, attempt, delay_ms = delay.as_millis() as u64, "scheduling restart");
            self.pending_restarts.insert(slot);
            self.notify(SupervisorNotice::RestartScheduled {
                slot,
                attempt,
                delay,
            });

            let tx = self.self_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(tx) = tx.upgrade() {
                    let _ = tx.send(Command::RestartDue { slot }).await;
                }
            });
        } else {
            let restarts = window.len();
            error!(slot, restarts, "restart limit exceeded, retiring slot");
            self.retired.insert(slot);
            self.notify(SupervisorNotice::RestartLimitExceeded { slot, restarts });
        }
    }

    // ── Worker events ────────────────────────────────────────────

    async fn handle_event(&mut self, event: WorkerEvent) {
        let WorkerEvent { slot, handle, kind } = event;
        let now = self.clock.now_millis();

        let Some(record) = self.workers.get_mut(&slot).filter(|w| w.handle == handle) else {
            debug!(slot, handle = %handle, "event from unknown worker ignored");
            return;
        };
        record.last_seen_at = Some(now);
        if record.status == WorkerStatus::Starting && !matches!(kind, WorkerEventKind::Exited { .. }) {
            record.status = WorkerStatus::Online;
            info!(slot, handle = %handle, "worker online");
        }

        match kind {
            WorkerEventKind::Online => {}
            WorkerEventKind::Metrics(update) => record.metrics.apply(&update),
            WorkerEventKind::Health { status } => {
                debug!(slot, status = %status, "worker health ping");
            }
            WorkerEventKind::Error { message } => {
                warn!(slot, error = %message, "worker reported error");
                self.notify(SupervisorNotice::WorkerError { slot, message });
            }
            WorkerEventKind::Exited { code, signal } => {
                self.handle_exit(slot, code, signal).await;
            }
        }
        self.note_capacity();
    }

    async fn handle_exit(&mut self, slot: SlotId, code: Option<i32>, signal: Option<i32>) {
        let Some(mut record) = self.workers.remove(&slot) else {
            return;
        };
        let requested = record.status == WorkerStatus::Draining;
        record.status = WorkerStatus::Exited;
        let waiters = self.waiters.remove(&slot).unwrap_or_default();

        if requested || code == Some(0) {
            info!(slot, handle = %record.handle, ?code, ?signal, "worker exited");
        } else {
            warn!(slot, handle = %record.handle, ?code, ?signal, "worker crashed");
            self.notify(SupervisorNotice::WorkerCrashed {
                slot,
                handle: record.handle,
                code,
                signal,
            });
            self.restart_or_retire(slot);
        }

        for waiter in waiters {
            match waiter {
                ExitWaiter::Stop(reply) => {
                    let _ = reply.send(Ok(()));
                }
                ExitWaiter::Replace(reply) => {
                    let result = match self.accepting() {
                        Ok(()) if self.workers.contains_key(&slot) => {
                            Err(SupervisorError::Runtime(format!("slot {slot} already refilled")))
                        }
                        Ok(()) => self.spawn_slot(slot).await,
                        Err(e) => Err(e),
                    };
                    let _ = reply.send(result);
                }
            }
        }
    }
}

// ── Handle ───────────────────────────────────────────────────────

/// Cloneable front door to the supervisor actor.
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<Command>,
    default_grace: Duration,
}

impl SupervisorHandle {
    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> SupervisorResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| SupervisorError::Closed)?;
        rx.await.map_err(|_| SupervisorError::Closed)
    }

    /// Start up to `count` workers (bounded by `max_workers`).
    pub async fn start(&self, count: u32) -> SupervisorResult<Vec<SlotId>> {
        self.call(|reply| Command::Start { count, reply }).await?
    }

    pub async fn scale_up(&self, count: u32) -> SupervisorResult<Vec<SlotId>> {
        self.call(|reply| Command::ScaleUp { count, reply }).await?
    }

    /// Returns the slots chosen for disconnect; they drain in the background.
    pub async fn scale_down(&self, count: u32) -> SupervisorResult<Vec<SlotId>> {
        self.call(|reply| Command::ScaleDown { count, reply }).await?
    }

    /// Disconnect one worker and wait for its exit, killing it after `grace`.
    pub async fn stop(&self, slot: SlotId, grace: Duration) -> SupervisorResult<()> {
        self.call(|reply| Command::Stop { slot, grace, reply }).await?
    }

    /// Replace a worker with a fresh one running the current version.
    pub async fn replace(&self, slot: SlotId) -> SupervisorResult<WorkerHandle> {
        self.call(|reply| Command::Replace { slot, reply }).await?
    }

    /// Manual restart of one slot. Does not count against its restart window.
    pub async fn restart_one(&self, slot: SlotId) -> SupervisorResult<WorkerHandle> {
        self.replace(slot).await
    }

    /// Replace every live worker, one at a time.
    pub async fn restart_all(&self) -> SupervisorResult<usize> {
        let status = self.status().await?;
        let slots: Vec<SlotId> = status
            .workers
            .iter()
            .filter(|w| w.status.is_live())
            .map(|w| w.slot)
            .collect();
        for &slot in &slots {
            self.replace(slot).await?;
        }
        Ok(slots.len())
    }

    /// Replace the live worker using the most memory.
    pub async fn recycle_heaviest(&self) -> SupervisorResult<Option<SlotId>> {
        let status = self.status().await?;
        let Some(slot) = status.heaviest().map(|w| w.slot) else {
            return Ok(None);
        };
        info!(slot, "recycling heaviest worker");
        self.replace(slot).await?;
        Ok(Some(slot))
    }

    /// Version given to workers spawned from now on.
    pub async fn set_version(&self, version: &str) -> SupervisorResult<()> {
        let version = version.to_string();
        self.call(|reply| Command::SetVersion { version, reply }).await
    }

    pub async fn status(&self) -> SupervisorResult<PoolStatus> {
        self.call(|reply| Command::Status { reply }).await
    }

    /// Starting plus online workers.
    pub async fn worker_count(&self) -> SupervisorResult<usize> {
        Ok(self.status().await?.live)
    }

    pub fn default_grace(&self) -> Duration {
        self.default_grace
    }

    /// Drain every worker and stop the actor. Idempotent; returns once
    /// every worker has exited.
    pub async fn shutdown(&self, grace: Duration) -> SupervisorResult<()> {
        match self.call(|reply| Command::Shutdown { grace, reply }).await {
            Ok(()) | Err(SupervisorError::Closed) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::MetricsUpdate;
    use fleet_core::{BoxFuture, ManualClock};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct MockRuntime {
        next: AtomicU64,
        /// Exit with code 0 when asked to disconnect.
        cooperative: bool,
        spawned: Mutex<Vec<SpawnSpec>>,
        senders: Mutex<HashMap<WorkerHandle, (SlotId, EventSender)>>,
        terminated: Mutex<Vec<WorkerHandle>>,
    }

    impl MockRuntime {
        fn cooperative() -> Self {
            Self {
                cooperative: true,
                ..Default::default()
            }
        }

        fn emit(&self, handle: WorkerHandle, kind: WorkerEventKind) {
            let senders = self.senders.lock().unwrap();
            let (slot, tx) = senders.get(&handle).expect("unknown handle");
            tx.send(WorkerEvent {
                slot: *slot,
                handle,
                kind,
            })
            .unwrap();
        }

        fn crash(&self, handle: WorkerHandle, code: i32) {
            self.emit(
                handle,
                WorkerEventKind::Exited {
                    code: Some(code),
                    signal: None,
                },
            );
        }

        fn spawned(&self) -> Vec<SpawnSpec> {
            self.spawned.lock().unwrap().clone()
        }
    }

    impl WorkerRuntime for MockRuntime {
        fn spawn(&self, spec: SpawnSpec, events: EventSender) -> BoxFuture<'_, SupervisorResult<WorkerHandle>> {
            let handle = WorkerHandle(self.next.fetch_add(1, Ordering::SeqCst) + 100);
            self.senders
                .lock()
                .unwrap()
                .insert(handle, (spec.slot, events));
            self.spawned.lock().unwrap().push(spec);
            Box::pin(async move { Ok(handle) })
        }

        fn signal(&self, handle: WorkerHandle, _command: WorkerCommand) -> BoxFuture<'_, SupervisorResult<()>> {
            if self.cooperative {
                self.emit(
                    handle,
                    WorkerEventKind::Exited {
                        code: Some(0),
                        signal: None,
                    },
                );
            }
            Box::pin(async { Ok(()) })
        }

        fn terminate(&self, handle: WorkerHandle) -> BoxFuture<'_, SupervisorResult<()>> {
            self.terminated.lock().unwrap().push(handle);
            self.emit(
                handle,
                WorkerEventKind::Exited {
                    code: None,
                    signal: Some(9),
                },
            );
            Box::pin(async { Ok(()) })
        }
    }

    fn settings() -> SupervisorSettings {
        SupervisorSettings {
            min_workers: 1,
            max_workers: 4,
            max_restarts: 3,
            restart_window: Duration::from_secs(60),
            restart_delay: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(5),
            runtime_timeout: Duration::from_secs(2),
            env: HashMap::from([("RUST_LOG".to_string(), "info".to_string())]),
            version: "1.0.0".into(),
        }
    }

    struct Harness {
        handle: SupervisorHandle,
        notices: mpsc::UnboundedReceiver<SupervisorNotice>,
        runtime: Arc<MockRuntime>,
        clock: ManualClock,
        lifecycle: Lifecycle,
    }

    impl Harness {
        fn new(settings: SupervisorSettings, runtime: MockRuntime) -> Self {
            let runtime = Arc::new(runtime);
            let clock = ManualClock::new(0);
            let lifecycle = Lifecycle::new();
            let (handle, notices, _task) = Supervisor::spawn(
                settings,
                runtime.clone(),
                lifecycle.clone(),
                Arc::new(clock.clone()),
            );
            Self {
                handle,
                notices,
                runtime,
                clock,
                lifecycle,
            }
        }

        /// Next notice that is not a capacity change.
        async fn notice(&mut self) -> SupervisorNotice {
            loop {
                match self.notices.recv().await.expect("notice stream closed") {
                    SupervisorNotice::CapacityChanged { .. } => continue,
                    other => return other,
                }
            }
        }

        async fn handles(&self) -> Vec<WorkerHandle> {
            let status = self.handle.status().await.unwrap();
            status.workers.iter().map(|w| w.handle).collect()
        }
    }

    #[tokio::test]
    async fn start_spawns_with_slot_and_version_env() {
        let h = Harness::new(settings(), MockRuntime::cooperative());
        let slots = h.handle.start(3).await.unwrap();
        assert_eq!(slots, vec![0, 1, 2]);

        let spawned = h.runtime.spawned();
        assert_eq!(spawned.len(), 3);
        assert_eq!(spawned[1].env.get(SLOT_ENV).map(String::as_str), Some("1"));
        assert_eq!(spawned[1].env.get(VERSION_ENV).map(String::as_str), Some("1.0.0"));
        assert_eq!(spawned[1].env.get("RUST_LOG").map(String::as_str), Some("info"));

        let status = h.handle.status().await.unwrap();
        assert_eq!(status.live, 3);
        assert!(status.workers.iter().all(|w| w.status == WorkerStatus::Starting));
    }

    #[tokio::test(start_paused = true)]
    async fn pending_restart_holds_its_capacity() {
        let mut s = settings();
        s.max_workers = 2;
        let mut h = Harness::new(s, MockRuntime::cooperative());
        h.handle.start(2).await.unwrap();
        let first = h.handles().await[0];

        h.runtime.crash(first, 1);
        while !matches!(h.notice().await, SupervisorNotice::RestartScheduled { slot: 0, .. }) {}
        assert!(matches!(
            h.handle.scale_up(1).await,
            Err(SupervisorError::Capacity(_))
        ));

        match h.notice().await {
            SupervisorNotice::WorkerRestarted { slot: 0, .. } => {}
            other => panic!("expected restart, got {other:?}"),
        }
        let status = h.handle.status().await.unwrap();
        assert_eq!(status.live, 2);
        assert!(status.workers.iter().all(|w| w.slot < 2));
    }

    #[tokio::test]
    async fn start_is_bounded_by_max_workers() {
        let h = Harness::new(settings(), MockRuntime::cooperative());
        assert_eq!(h.handle.start(10).await.unwrap().len(), 4);
        assert!(matches!(
            h.handle.scale_up(1).await,
            Err(SupervisorError::Capacity(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn fourth_crash_in_window_escalates() {
        let mut h = Harness::new(settings(), MockRuntime::cooperative());
        h.handle.start(1).await.unwrap();
        let mut current = h.handles().await[0];

        for attempt in 1..=3 {
            h.runtime.crash(current, 1);
            assert!(matches!(
                h.notice().await,
                SupervisorNotice::WorkerCrashed { slot: 0, code: Some(1), .. }
            ));
            assert_eq!(
                h.notice().await,
                SupervisorNotice::RestartScheduled {
                    slot: 0,
                    attempt,
                    delay: Duration::from_secs(1)
                }
            );
            match h.notice().await {
                SupervisorNotice::WorkerRestarted { slot: 0, handle } => current = handle,
                other => panic!("expected restart, got {other:?}"),
            }
            h.clock.advance(Duration::from_secs(15));
        }

        // Fourth crash at t=45s: three restarts already in the 60s window.
        h.runtime.crash(current, 1);
        assert!(matches!(h.notice().await, SupervisorNotice::WorkerCrashed { .. }));
        assert_eq!(
            h.notice().await,
            SupervisorNotice::RestartLimitExceeded {
                slot: 0,
                restarts: 3
            }
        );

        let status = h.handle.status().await.unwrap();
        assert_eq!(status.live, 0);
        assert_eq!(status.retired_slots, vec![0]);
        assert_eq!(h.runtime.spawned().len(), 4);

        // A retired slot is never reused.
        assert_eq!(h.handle.scale_up(1).await.unwrap(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn crashes_outside_window_keep_restarting() {
        let mut h = Harness::new(settings(), MockRuntime::cooperative());
        h.handle.start(1).await.unwrap();
        let mut current = h.handles().await[0];

        for _ in 0..5 {
            h.runtime.crash(current, 2);
            h.notice().await;
            assert!(matches!(h.notice().await, SupervisorNotice::RestartScheduled { .. }));
            if let SupervisorNotice::WorkerRestarted { handle, .. } = h.notice().await {
                current = handle;
            }
            h.clock.advance(Duration::from_secs(30));
        }
        assert!(h.handle.status().await.unwrap().retired_slots.is_empty());
    }

    #[tokio::test]
    async fn clean_exit_is_not_restarted() {
        let mut h = Harness::new(settings(), MockRuntime::cooperative());
        h.handle.start(2).await.unwrap();
        let handles = h.handles().await;
        h.runtime.crash(handles[0], 0);

        let status = h.handle.status().await.unwrap();
        assert_eq!(status.live, 1);
        assert!(status.pending_restarts.is_empty());
        while let Ok(n) = h.notices.try_recv() {
            assert!(matches!(n, SupervisorNotice::CapacityChanged { .. }), "{n:?}");
        }
    }

    #[tokio::test]
    async fn scale_down_picks_fewest_requests_then_lowest_slot() {
        let h = Harness::new(settings(), MockRuntime::cooperative());
        h.handle.start(3).await.unwrap();
        let handles = h.handles().await;
        for (handle, requests) in handles.iter().zip([50, 10, 10]) {
            h.runtime.emit(
                *handle,
                WorkerEventKind::Metrics(MetricsUpdate {
                    requests: Some(requests),
                    ..Default::default()
                }),
            );
        }

        assert_eq!(h.handle.scale_down(1).await.unwrap(), vec![1]);
        let status = h.handle.status().await.unwrap();
        let slots: Vec<SlotId> = status.workers.iter().map(|w| w.slot).collect();
        assert_eq!(slots, vec![0, 2]);
        assert!(status.workers.iter().all(|w| w.status == WorkerStatus::Online));
    }

    #[tokio::test]
    async fn scale_down_respects_min_workers() {
        let h = Harness::new(settings(), MockRuntime::cooperative());
        h.handle.start(2).await.unwrap();
        assert_eq!(h.handle.scale_down(5).await.unwrap().len(), 1);
        assert!(matches!(
            h.handle.scale_down(1).await,
            Err(SupervisorError::Capacity(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn stubborn_worker_is_killed_after_grace() {
        let h = Harness::new(settings(), MockRuntime::default());
        h.handle.start(1).await.unwrap();
        let handle = h.handles().await[0];

        let started = tokio::time::Instant::now();
        h.handle.stop(0, Duration::from_secs(3)).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(*h.runtime.terminated.lock().unwrap(), vec![handle]);
        assert_eq!(h.handle.worker_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stop_unknown_slot_fails() {
        let h = Harness::new(settings(), MockRuntime::cooperative());
        assert!(matches!(
            h.handle.stop(7, Duration::from_secs(1)).await,
            Err(SupervisorError::UnknownSlot(7))
        ));
    }

    #[tokio::test]
    async fn replace_uses_current_version_and_is_not_a_crash() {
        let mut h = Harness::new(settings(), MockRuntime::cooperative());
        h.handle.start(2).await.unwrap();
        let old = h.handles().await;

        h.handle.set_version("2.0.0").await.unwrap();
        let new = h.handle.replace(1).await.unwrap();
        assert_ne!(new, old[1]);

        let status = h.handle.status().await.unwrap();
        assert_eq!(status.version, "2.0.0");
        assert_eq!(status.workers[0].version, "1.0.0");
        assert_eq!(status.workers[1].version, "2.0.0");
        assert_eq!(status.workers[1].handle, new);

        while let Ok(n) = h.notices.try_recv() {
            assert!(matches!(n, SupervisorNotice::CapacityChanged { .. }), "{n:?}");
        }
    }

    #[tokio::test]
    async fn recycle_heaviest_replaces_biggest_worker() {
        let h = Harness::new(settings(), MockRuntime::cooperative());
        h.handle.start(3).await.unwrap();
        let handles = h.handles().await;
        for (handle, memory) in handles.iter().zip([100.0, 900.0, 300.0]) {
            h.runtime.emit(
                *handle,
                WorkerEventKind::Metrics(MetricsUpdate {
                    memory: Some(memory),
                    ..Default::default()
                }),
            );
        }

        assert_eq!(h.handle.recycle_heaviest().await.unwrap(), Some(1));
        let after = h.handles().await;
        assert_eq!(after[0], handles[0]);
        assert_ne!(after[1], handles[1]);
    }

    #[tokio::test]
    async fn stale_events_are_ignored() {
        let h = Harness::new(settings(), MockRuntime::cooperative());
        h.handle.start(1).await.unwrap();
        let old = h.handles().await[0];
        h.handle.replace(0).await.unwrap();

        // The old incarnation's late error must not touch the new record.
        h.runtime.emit(
            old,
            WorkerEventKind::Metrics(MetricsUpdate {
                errors: Some(99),
                ..Default::default()
            }),
        );
        let status = h.handle.status().await.unwrap();
        assert_eq!(status.workers[0].metrics.errors, 0);
    }

    #[tokio::test]
    async fn worker_errors_are_forwarded() {
        let mut h = Harness::new(settings(), MockRuntime::cooperative());
        h.handle.start(1).await.unwrap();
        let handle = h.handles().await[0];
        h.runtime.emit(
            handle,
            WorkerEventKind::Error {
                message: "db timeout".into(),
            },
        );
        assert_eq!(
            h.notice().await,
            SupervisorNotice::WorkerError {
                slot: 0,
                message: "db timeout".into()
            }
        );
    }

    #[tokio::test]
    async fn no_restart_once_shutting_down() {
        let mut h = Harness::new(settings(), MockRuntime::cooperative());
        h.handle.start(2).await.unwrap();
        let handles = h.handles().await;

        h.lifecycle.begin_shutdown();
        h.runtime.crash(handles[0], 1);
        assert!(matches!(h.notice().await, SupervisorNotice::WorkerCrashed { .. }));
        assert!(matches!(
            h.handle.scale_up(1).await,
            Err(SupervisorError::NotRunning)
        ));
        let status = h.handle.status().await.unwrap();
        assert!(status.pending_restarts.is_empty());
        assert_eq!(status.live, 1);
    }

    #[tokio::test]
    async fn shutdown_drains_everything_and_is_idempotent() {
        let h = Harness::new(settings(), MockRuntime::cooperative());
        h.handle.start(3).await.unwrap();

        h.handle.shutdown(Duration::from_secs(1)).await.unwrap();
        h.handle.shutdown(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(h.handle.status().await, Err(SupervisorError::Closed)));
    }

    #[test]
    fn pool_status_aggregates_live_workers() {
        let mut a = WorkerRecord::new(0, WorkerHandle(1), "1", 0);
        a.status = WorkerStatus::Online;
        a.metrics.cpu = 40.0;
        a.metrics.memory = 100.0;
        a.metrics.requests = 7;
        let mut b = WorkerRecord::new(1, WorkerHandle(2), "1", 0);
        b.status = WorkerStatus::Online;
        b.metrics.cpu = 80.0;
        b.metrics.memory = 300.0;
        b.metrics.requests = 3;
        let mut c = WorkerRecord::new(2, WorkerHandle(3), "1", 0);
        c.status = WorkerStatus::Draining;
        c.metrics.cpu = 100.0;

        let status = PoolStatus {
            version: "1".into(),
            min_workers: 1,
            max_workers: 4,
            live: 2,
            online: 2,
            draining: 1,
            pending_restarts: vec![],
            retired_slots: vec![],
            workers: vec![a, b, c],
        };
        assert_eq!(status.avg_cpu(), 60.0);
        assert_eq!(status.avg_memory(), 200.0);
        assert_eq!(status.total_requests(), 10);
        assert_eq!(status.heaviest().map(|w| w.slot), Some(1));
    }
}
