//! Circuit breakers for external resources.
//!
//! The breaker here is deliberately two-state: it is either closed or
//! open, and an open breaker only flags the resource as degraded. It never
//! probes half-open and never closes itself; `reset` is the only way
//! back. Callers go through the `CircuitBreaker` trait so a full
//! closed/open/half-open implementation can be swapped in via
//! `BreakerRegistry::with_factory`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

/// Snapshot of one breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerRecord {
    pub resource: String,
    pub opened: bool,
    pub opened_at: Option<u64>,
    pub next_attempt_at: Option<u64>,
}

pub trait CircuitBreaker: Send + Sync {
    /// Open the breaker at `now`, suggesting a retry after `retry_after`.
    fn open(&self, now: u64, retry_after: Duration);
    /// Close the breaker.
    fn reset(&self);
    /// Whether the resource should currently be treated as degraded.
    fn is_open(&self) -> bool;
    fn record(&self) -> CircuitBreakerRecord;
}

/// Two-state breaker: closed or open until reset.
pub struct SimpleBreaker {
    state: Mutex<CircuitBreakerRecord>,
}

impl SimpleBreaker {
    pub fn new(resource: &str) -> Self {
        Self {
            state: Mutex::new(CircuitBreakerRecord {
                resource: resource.to_string(),
                opened: false,
                opened_at: None,
                next_attempt_at: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CircuitBreakerRecord> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl CircuitBreaker for SimpleBreaker {
    fn open(&self, now: u64, retry_after: Duration) {
        let mut state = self.lock();
        if !state.opened {
            state.opened = true;
            state.opened_at = Some(now);
            warn!(resource = %state.resource, "circuit breaker opened");
        }
        state.next_attempt_at = Some(now + retry_after.as_millis() as u64);
    }

    fn reset(&self) {
        let mut state = self.lock();
        if state.opened {
            info!(resource = %state.resource, "circuit breaker reset");
        }
        state.opened = false;
        state.opened_at = None;
        state.next_attempt_at = None;
    }

    fn is_open(&self) -> bool {
        self.lock().opened
    }

    fn record(&self) -> CircuitBreakerRecord {
        self.lock().clone()
    }
}

type BreakerFactory = dyn Fn(&str) -> Arc<dyn CircuitBreaker> + Send + Sync;

/// Breakers keyed by resource name, created on first use.
pub struct BreakerRegistry {
    breakers: Mutex<BTreeMap<String, Arc<dyn CircuitBreaker>>>,
    factory: Box<BreakerFactory>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::with_factory(|resource| Arc::new(SimpleBreaker::new(resource)))
    }

    pub fn with_factory<F>(factory: F) -> Self
    where
        F: Fn(&str) -> Arc<dyn CircuitBreaker> + Send + Sync + 'static,
    {
        Self {
            breakers: Mutex::new(BTreeMap::new()),
            factory: Box::new(factory),
        }
    }

    pub fn get(&self, resource: &str) -> Arc<dyn CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        breakers
            .entry(resource.to_string())
            .or_insert_with(|| (self.factory)(resource))
            .clone()
    }

    pub fn open(&self, resource: &str, now: u64, retry_after: Duration) {
        self.get(resource).open(now, retry_after);
    }

    /// Close a breaker. Unknown resources are ignored.
    pub fn reset(&self, resource: &str) -> bool {
        let breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        match breakers.get(resource) {
            Some(b) => {
                b.reset();
                true
            }
            None => false,
        }
    }

    pub fn is_open(&self, resource: &str) -> bool {
        let breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        breakers.get(resource).is_some_and(|b| b.is_open())
    }

    pub fn records(&self) -> Vec<CircuitBreakerRecord> {
        let breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        breakers.values().map(|b| b.record()).collect()
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
