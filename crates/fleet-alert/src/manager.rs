//! Async front of the alert engine.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use fleet_core::config::AlertsConfig;
use fleet_core::{MetricsSnapshot, SharedClock};

use crate::dispatcher::{DispatchReport, NotificationDispatcher};
use crate::engine::AlertEngine;
use crate::notification::{Alert, Notification};
use crate::rule::{AlertRule, RuleState, default_rules};

/// Owns the rule engine and the dispatcher.
///
/// The engine lock is released before delivery, so a slow transport never
/// holds up the next evaluation.
pub struct AlertManager {
    engine: Mutex<AlertEngine>,
    dispatcher: Arc<NotificationDispatcher>,
    clock: SharedClock,
}

impl AlertManager {
    pub fn new(engine: AlertEngine, dispatcher: Arc<NotificationDispatcher>, clock: SharedClock) -> Self {
        Self {
            engine: Mutex::new(engine),
            dispatcher,
            clock,
        }
    }

    /// Build from config. No configured rules means the default set.
    pub fn from_config(
        cfg: &AlertsConfig,
        dispatcher: Arc<NotificationDispatcher>,
        clock: SharedClock,
    ) -> Self {
        let rules = if cfg.rules.is_empty() {
            default_rules()
        } else {
            cfg.rules.iter().map(AlertRule::from_config).collect()
        };
        let engine = AlertEngine::new(rules)
            .with_host(cfg.host.clone())
            .with_aggregation(&cfg.aggregation);
        Self::new(engine, dispatcher, clock)
    }

    /// Evaluate a metrics tick and deliver whatever it produced.
    pub async fn on_metrics(&self, snapshot: &MetricsSnapshot) -> Vec<DispatchReport> {
        let now = self.clock.now_millis();
        let outgoing = {
            let mut engine = self.engine.lock().await;
            let mut out = engine.evaluate(snapshot, now);
            out.extend(engine.flush_due(now));
            out
        };
        self.deliver(outgoing).await
    }

    /// Raise an alert that did not come from a rule.
    pub async fn raise(&self, alert: Alert) -> Option<DispatchReport> {
        let now = self.clock.now_millis();
        let outgoing = self.engine.lock().await.submit(alert, now);
        match outgoing {
            Some(n) => Some(self.dispatcher.send(&n).await),
            None => None,
        }
    }

    /// Flush the aggregation buffer if its window elapsed.
    pub async fn flush_due(&self) -> Option<DispatchReport> {
        let now = self.clock.now_millis();
        let outgoing = self.engine.lock().await.flush_due(now);
        match outgoing {
            Some(n) => Some(self.dispatcher.send(&n).await),
            None => None,
        }
    }

    /// Flush whatever is buffered. Used on shutdown.
    pub async fn flush(&self) -> Option<DispatchReport> {
        let now = self.clock.now_millis();
        let outgoing = self.engine.lock().await.flush(now);
        match outgoing {
            Some(n) => {
                debug!("flushing pending alerts");
                Some(self.dispatcher.send(&n).await)
            }
            None => None,
        }
    }

    pub async fn active(&self) -> Vec<String> {
        self.engine.lock().await.active()
    }

    pub async fn rule_state(&self, rule_id: &str) -> Option<RuleState> {
        self.engine.lock().await.state(rule_id).cloned()
    }

    pub async fn pending(&self) -> usize {
        self.engine.lock().await.pending()
    }

    async fn deliver(&self, outgoing: Vec<Notification>) -> Vec<DispatchReport> {
        let mut reports = Vec::with_capacity(outgoing.len());
        for notification in &outgoing {
            reports.push(self.dispatcher.send(notification).await);
        }
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportResult;
    use crate::transport::Transport;
    use fleet_core::config::AlertRuleConfig;
    use fleet_core::{BoxFuture, ManualClock, MetricValue, Operator, Severity};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        seen: StdMutex<Vec<Notification>>,
    }

    impl Transport for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }
        fn deliver<'a>(&'a self, n: &'a Notification) -> BoxFuture<'a, TransportResult<()>> {
            self.seen.lock().unwrap().push(n.clone());
            Box::pin(async { Ok(()) })
        }
    }

    fn setup(cfg: AlertsConfig) -> (AlertManager, Arc<Recorder>, ManualClock) {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = Arc::new(NotificationDispatcher::new(
            vec![recorder.clone()],
            Duration::from_secs(1),
        ));
        let clock = ManualClock::new(0);
        let manager = AlertManager::from_config(&cfg, dispatcher, Arc::new(clock.clone()));
        (manager, recorder, clock)
    }

    #[tokio::test]
    async fn empty_config_uses_default_rules() {
        let (manager, recorder, _clock) = setup(AlertsConfig::default());
        let snap = MetricsSnapshot::new(0).with("workers.crashes", 4.0);
        manager.on_metrics(&snap).await;

        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(matches!(&seen[0], Notification::Alert(a) if a.rule_id == "worker_crashes"));
    }

    #[tokio::test]
    async fn configured_rules_replace_defaults() {
        let mut cfg = AlertsConfig::default();
        cfg.host = Some("edge-7".into());
        cfg.rules.push(AlertRuleConfig {
            id: "queue_depth".into(),
            name: Some("Queue backlog".into()),
            metric: "queue.depth".into(),
            operator: Operator::Gt,
            threshold: MetricValue::from(100.0),
            duration: "0s".into(),
            severity: Severity::Warning,
            cooldown: "1m".into(),
        });
        let (manager, recorder, clock) = setup(cfg);

        let snap = MetricsSnapshot::new(0)
            .with("queue.depth", 150.0)
            .with("workers.crashes", 9.0);
        manager.on_metrics(&snap).await;
        clock.advance(Duration::from_secs(10));
        manager
            .on_metrics(&MetricsSnapshot::new(0).with("queue.depth", 20.0))
            .await;

        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        match &seen[0] {
            Notification::Alert(a) => {
                assert_eq!(a.title, "Queue backlog");
                assert_eq!(a.host.as_deref(), Some("edge-7"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(&seen[1], Notification::Recovery(r) if r.was_firing));
    }

    #[tokio::test]
    async fn raised_alerts_are_aggregated_and_flushed() {
        let mut cfg = AlertsConfig::default();
        cfg.aggregation.enabled = true;
        cfg.aggregation.window = "1m".into();
        let (manager, recorder, clock) = setup(cfg);

        assert!(manager
            .raise(Alert::raised("error_threshold", Severity::Warning, "10 errors", 0))
            .await
            .is_none());
        assert_eq!(manager.pending().await, 1);

        clock.advance(Duration::from_secs(30));
        assert!(manager.flush_due().await.is_none());

        let report = manager.flush().await.unwrap();
        assert_eq!(report.delivered, vec!["recorder".to_string()]);
        assert_eq!(manager.pending().await, 0);
        assert!(manager.flush().await.is_none());

        let seen = recorder.seen.lock().unwrap();
        assert!(matches!(&seen[0], Notification::Grouped(g) if g.alerts.len() == 1));
    }
}
