//! Concurrent, failure-isolated fan-out to transports.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use tracing::{debug, warn};

use fleet_core::Severity;

use crate::error::{TransportError, TransportResult};
use crate::notification::Notification;
use crate::transport::Transport;

/// Per-transport outcome of one `send`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub delivered: Vec<String>,
    /// `(transport, error)` pairs.
    pub failed: Vec<(String, String)>,
    /// Transports not eligible for this notification.
    pub skipped: Vec<String>,
}

impl DispatchReport {
    pub fn all_delivered(&self) -> bool {
        self.failed.is_empty()
    }
}

enum Action {
    Deliver,
    /// One page per critical alert of a group, so each incident is keyed
    /// by its own rule id.
    DeliverEach(Vec<Notification>),
    Resolve(String),
    Skip,
}

pub struct NotificationDispatcher {
    transports: Vec<Arc<dyn Transport>>,
    timeout: Duration,
}

impl NotificationDispatcher {
    pub fn new(transports: Vec<Arc<dyn Transport>>, timeout: Duration) -> Self {
        Self {
            transports,
            timeout,
        }
    }

    pub fn transport_names(&self) -> Vec<&str> {
        self.transports.iter().map(|t| t.name()).collect()
    }

    fn action_for(transport: &dyn Transport, notification: &Notification) -> Action {
        if !transport.critical_only() {
            return Action::Deliver;
        }
        match notification {
            Notification::Recovery(r)
                if r.was_firing && r.previous_severity == Severity::Critical =>
            {
                Action::Resolve(r.rule_id.clone())
            }
            Notification::Recovery(_) => Action::Skip,
            Notification::Grouped(g) => {
                let pages: Vec<Notification> = g
                    .alerts
                    .iter()
                    .filter(|a| a.severity == Severity::Critical)
                    .cloned()
                    .map(Notification::Alert)
                    .collect();
                if pages.is_empty() {
                    Action::Skip
                } else {
                    Action::DeliverEach(pages)
                }
            }
            n if n.severity() == Severity::Critical => Action::Deliver,
            _ => Action::Skip,
        }
    }

    /// Send to every enabled transport concurrently and wait for all of
    /// them. Never fails; failures are logged and reported.
    pub async fn send(&self, notification: &Notification) -> DispatchReport {
        let mut report = DispatchReport::default();
        let mut pending = Vec::new();

        for transport in self.transports.iter().filter(|t| t.enabled()) {
            match Self::action_for(transport.as_ref(), notification) {
                Action::Skip => report.skipped.push(transport.name().to_string()),
                action => pending.push((transport.clone(), action)),
            }
        }

        let timeout = self.timeout;
        let deliveries = pending.iter().map(|(transport, action)| async move {
            let call = perform(transport.as_ref(), action, notification);
            let result = match tokio::time::timeout(timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(timeout)),
            };
            (transport.name().to_string(), result)
        });

        for (name, result) in join_all(deliveries).await {
            match result {
                Ok(()) => {
                    debug!(transport = %name, "notification delivered");
                    report.delivered.push(name);
                }
                Err(e) => {
                    warn!(transport = %name, error = %e, "notification delivery failed");
                    report.failed.push((name, e.to_string()));
                }
            }
        }

        report
    }
}

async fn perform(
    transport: &dyn Transport,
    action: &Action,
    notification: &Notification,
) -> TransportResult<()> {
    match action {
        Action::Resolve(key) => transport.resolve(key).await,
        Action::DeliverEach(pages) => {
            for page in pages {
                transport.deliver(page).await?;
            }
            Ok(())
        }
        Action::Deliver | Action::Skip => transport.deliver(notification).await,
    }
}
