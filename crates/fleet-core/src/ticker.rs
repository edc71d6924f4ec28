//! Periodic tasks with a shared cancel signal.
//!
//! Every background loop in the daemon (metrics, health, autoscale,
//! aggregation flush) is a `TaskSet` member. A tick is awaited before the
//! next sleep starts, so ticks of one task never overlap. `cancel()` stops
//! all loops; it is the first step of graceful shutdown.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A named group of cancellable periodic tasks.
pub struct TaskSet {
    cancel_tx: watch::Sender<bool>,
    handles: Vec<(String, JoinHandle<()>)>,
}

impl TaskSet {
    pub fn new() -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            cancel_tx,
            handles: Vec::new(),
        }
    }

    /// Receiver that flips to `true` when the set is cancelled.
    pub fn cancel_signal(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    /// Spawn `tick` every `interval` until cancelled.
    pub fn spawn_periodic<F, Fut>(&mut self, name: &str, interval: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut cancel = self.cancel_tx.subscribe();
        let task_name = name.to_string();

        let handle = tokio::spawn(async move {
            debug!(task = %task_name, interval_ms = interval.as_millis() as u64, "periodic task started");
            loop {
                if *cancel.borrow() {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        tick().await;
                    }
                    _ = cancel.changed() => {
                        break;
                    }
                }
            }
            debug!(task = %task_name, "periodic task stopped");
        });

        self.handles.push((name.to_string(), handle));
    }

    /// Spawn a one-off background task that should also stop on cancel.
    ///
    /// The task receives the cancel signal and is expected to honour it.
    pub fn spawn<F, Fut>(&mut self, name: &str, task: F)
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task(self.cancel_tx.subscribe()));
        self.handles.push((name.to_string(), handle));
    }

    /// Signal every task to stop. Idempotent.
    pub fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Cancel, then wait up to `timeout` for each task; abort stragglers.
    pub async fn shutdown(self, timeout: Duration) {
        self.cancel();
        for (name, mut handle) in self.handles {
            match tokio::time::timeout(timeout, &mut handle).await {
                Ok(_) => {}
                Err(_) => {
                    warn!(task = %name, "periodic task did not stop in time, aborting");
                    handle.abort();
                }
            }
        }
        info!("periodic tasks stopped");
    }
}

impl Default for TaskSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn ticks_until_cancelled() {
        let counter = Arc::new(AtomicU32::new(0));
        let mut tasks = TaskSet::new();

        let c = counter.clone();
        tasks.spawn_periodic("count", Duration::from_secs(1), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);

        tasks.shutdown(Duration::from_secs(1)).await;
        let after = counter.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(counter.load(Ordering::SeqCst), after);
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_never_overlap() {
        let in_flight = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));
        let mut tasks = TaskSet::new();

        let (f, m) = (in_flight.clone(), max_seen.clone());
        tasks.spawn_periodic("slow", Duration::from_millis(10), move || {
            let (f, m) = (f.clone(), m.clone());
            async move {
                let now = f.fetch_add(1, Ordering::SeqCst) + 1;
                m.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                f.fetch_sub(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(500)).await;
        tasks.shutdown(Duration::from_secs(1)).await;
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let tasks = TaskSet::new();
        tasks.cancel();
        tasks.cancel();
        assert!(tasks.is_cancelled());
        assert!(tasks.is_empty());
    }
}
