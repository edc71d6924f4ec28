//! Rule evaluation state machine.
//!
//! The engine is synchronous and takes `now` explicitly. Async concerns
//! (locking, delivery) live in [`crate::manager::AlertManager`].

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, info};

use fleet_core::MetricsSnapshot;
use fleet_core::config::AggregationConfig;

use crate::notification::{Alert, AlertGroup, Notification, Recovery};
use crate::rule::{AlertRule, RuleState, recommendations};

/// Buffers fired alerts until the window elapses or the buffer is full.
#[derive(Debug)]
struct Aggregator {
    window: Duration,
    max_alerts: usize,
    buffer: Vec<Alert>,
    started_at: Option<u64>,
}

impl Aggregator {
    fn push(&mut self, alert: Alert, now: u64) -> Option<Notification> {
        self.started_at.get_or_insert(now);
        self.buffer.push(alert);
        if self.buffer.len() >= self.max_alerts {
            return self.flush(now);
        }
        None
    }

    fn holds(&self, rule_id: &str) -> bool {
        self.buffer.iter().any(|a| a.rule_id == rule_id)
    }

    fn flush_due(&mut self, now: u64) -> Option<Notification> {
        let started = self.started_at?;
        if now.saturating_sub(started) >= millis(self.window) {
            return self.flush(now);
        }
        None
    }

    fn flush(&mut self, now: u64) -> Option<Notification> {
        let started = self.started_at.take()?;
        if self.buffer.is_empty() {
            return None;
        }
        let alerts = std::mem::take(&mut self.buffer);
        debug!(count = alerts.len(), "flushing aggregated alerts");
        Some(Notification::Grouped(AlertGroup::new(alerts, started, now)))
    }
}

/// Whole milliseconds, clamped to `u64::MAX`.
fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

pub struct AlertEngine {
    rules: Vec<AlertRule>,
    states: HashMap<String, RuleState>,
    host: Option<String>,
    aggregator: Option<Aggregator>,
}

impl AlertEngine {
    pub fn new(rules: Vec<AlertRule>) -> Self {
        let states = rules
            .iter()
            .map(|r| (r.id.clone(), RuleState::default()))
            .collect();
        Self {
            rules,
            states,
            host: None,
            aggregator: None,
        }
    }

    pub fn with_host(mut self, host: Option<String>) -> Self {
        self.host = host;
        self
    }

    /// Enable aggregation per config. A disabled config sends immediately.
    pub fn with_aggregation(mut self, cfg: &AggregationConfig) -> Self {
        self.aggregator = cfg.enabled.then(|| Aggregator {
            window: cfg.window(),
            max_alerts: cfg.max_alerts.max(1),
            buffer: Vec::new(),
            started_at: None,
        });
        self
    }

    pub fn rules(&self) -> &[AlertRule] {
        &self.rules
    }

    pub fn state(&self, rule_id: &str) -> Option<&RuleState> {
        self.states.get(rule_id)
    }

    /// Ids of rules whose condition currently holds.
    pub fn active(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .states
            .iter()
            .filter(|(_, s)| s.triggered)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Evaluate every rule against `snapshot`.
    ///
    /// Returns what must be sent now: recoveries, alerts (when not
    /// aggregating) and any group flushed because it filled up.
    pub fn evaluate(&mut self, snapshot: &MetricsSnapshot, now: u64) -> Vec<Notification> {
        let mut out = Vec::new();
        let mut fired = Vec::new();

        for rule in &self.rules {
            let Some(value) = snapshot.get(&rule.metric) else {
                continue;
            };
            let state = self.states.entry(rule.id.clone()).or_default();
            state.current_value = Some(value.clone());

            if rule.matches(value) {
                if !state.triggered {
                    state.triggered = true;
                    state.first_triggered_at = Some(now);
                    debug!(rule = %rule.id, value = %value, "rule condition met");
                }
                let first = state.first_triggered_at.unwrap_or(now);
                let held = now.saturating_sub(first) >= millis(rule.duration);
                if held && now >= state.cooldown_until {
                    state.last_fired_at = Some(now);
                    state.cooldown_until = now.saturating_add(millis(rule.cooldown));
                    info!(rule = %rule.id, severity = %rule.severity, value = %value, "alert fired");
                    fired.push(Alert {
                        rule_id: rule.id.clone(),
                        title: rule.name.clone(),
                        severity: rule.severity,
                        message: rule.describe(value),
                        fired_at: now,
                        host: self.host.clone(),
                        value: Some(value.clone()),
                        snapshot: Some(snapshot.clone()),
                        recommendations: recommendations(&rule.id)
                            .iter()
                            .map(|s| s.to_string())
                            .collect(),
                    });
                }
            } else if state.triggered {
                let was_firing = state.fired_this_episode();
                state.triggered = false;
                state.first_triggered_at = None;
                info!(rule = %rule.id, value = %value, was_firing, "rule recovered");
                // A still-buffered alert for this rule goes out ahead of its recovery.
                if let Some(agg) = self.aggregator.as_mut()
                    && agg.holds(&rule.id)
                {
                    out.extend(agg.flush(now));
                }
                out.push(Notification::Recovery(Recovery {
                    rule_id: rule.id.clone(),
                    title: rule.name.clone(),
                    previous_severity: rule.severity,
                    was_firing,
                    value: value.clone(),
                    recovered_at: now,
                    host: self.host.clone(),
                }));
            }
        }

        for alert in fired {
            if let Some(n) = self.submit(alert, now) {
                out.push(n);
            }
        }
        out
    }

    /// Route an alert through aggregation. Returns it (or a flushed group)
    /// if something must be sent now.
    pub fn submit(&mut self, mut alert: Alert, now: u64) -> Option<Notification> {
        if alert.host.is_none() {
            alert.host = self.host.clone();
        }
        match self.aggregator.as_mut() {
            Some(agg) => agg.push(alert, now),
            None => Some(Notification::Alert(alert)),
        }
    }

    /// Flush the aggregation buffer if its window has elapsed.
    pub fn flush_due(&mut self, now: u64) -> Option<Notification> {
        self.aggregator.as_mut()?.flush_due(now)
    }

    /// Flush the aggregation buffer unconditionally.
    pub fn flush(&mut self, now: u64) -> Option<Notification> {
        self.aggregator.as_mut()?.flush(now)
    }

    pub fn pending(&self) -> usize {
        self.aggregator.as_ref().map_or(0, |a| a.buffer.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::{Operator, Severity};

    const SEC: u64 = 1_000;

    fn cpu_rule() -> AlertRule {
        AlertRule::new("high_cpu", "cpu", Operator::Gt, 80.0)
            .lasting(Duration::from_secs(300))
            .cooldown(Duration::from_secs(900))
            .severity(Severity::Critical)
    }

    fn cpu(v: f64, at: u64) -> MetricsSnapshot {
        MetricsSnapshot::new(at).with("cpu", v)
    }

    fn alerts(out: &[Notification]) -> usize {
        out.iter()
            .filter(|n| matches!(n, Notification::Alert(_)))
            .count()
    }

    fn recoveries(out: &[Notification]) -> usize {
        out.iter()
            .filter(|n| matches!(n, Notification::Recovery(_)))
            .count()
    }

    #[test]
    fn cpu_example_fires_once_and_recovers_once() {
        let mut engine = AlertEngine::new(vec![cpu_rule()]);
        let mut fires = Vec::new();
        let mut recovered = Vec::new();

        // 85% for 310 s, 50% at 320 s, spike back to 90% from 400 s on.
        let mut t = 0;
        while t <= 1_000 {
            let value = match t {
                0..=310 => 85.0,
                311..=399 => 50.0,
                _ => 90.0,
            };
            let out = engine.evaluate(&cpu(value, t * SEC), t * SEC);
            for n in out {
                match n {
                    Notification::Alert(a) => fires.push(a.fired_at / SEC),
                    Notification::Recovery(r) => recovered.push((r.recovered_at / SEC, r.was_firing)),
                    Notification::Grouped(_) => unreachable!(),
                }
            }
            t += 10;
        }

        assert_eq!(fires, vec![300]);
        assert_eq!(recovered, vec![(320, true)]);
        // Still pending from 400 s, but held back by the cooldown until 1200 s.
        let state = engine.state("high_cpu").unwrap();
        assert!(state.triggered);
        assert_eq!(state.cooldown_until, 1_200 * SEC);
    }

    #[test]
    fn fires_only_after_duration_under_uneven_ticks() {
        let mut engine = AlertEngine::new(vec![cpu_rule()]);
        for t in [0, 7, 130, 299] {
            assert_eq!(alerts(&engine.evaluate(&cpu(95.0, 0), t * SEC)), 0, "t={t}");
        }
        assert_eq!(alerts(&engine.evaluate(&cpu(95.0, 0), 301 * SEC)), 1);
    }

    #[test]
    fn interruption_restarts_the_duration() {
        let mut engine = AlertEngine::new(vec![cpu_rule()]);
        engine.evaluate(&cpu(95.0, 0), 0);
        engine.evaluate(&cpu(95.0, 0), 200 * SEC);
        let out = engine.evaluate(&cpu(60.0, 0), 250 * SEC);
        assert_eq!(recoveries(&out), 1);
        engine.evaluate(&cpu(95.0, 0), 260 * SEC);
        assert_eq!(alerts(&engine.evaluate(&cpu(95.0, 0), 400 * SEC)), 0);
        assert_eq!(alerts(&engine.evaluate(&cpu(95.0, 0), 560 * SEC)), 1);
    }

    #[test]
    fn zero_duration_fires_on_first_tick() {
        let rule = AlertRule::new("errors", "errors", Operator::Ge, 1.0);
        let mut engine = AlertEngine::new(vec![rule]);
        let out = engine.evaluate(&MetricsSnapshot::new(0).with("errors", 3.0), 5 * SEC);
        assert_eq!(alerts(&out), 1);
    }

    #[test]
    fn cooldown_spaces_fires() {
        let rule = AlertRule::new("errors", "errors", Operator::Ge, 1.0)
            .cooldown(Duration::from_secs(60));
        let mut engine = AlertEngine::new(vec![rule]);
        let snap = MetricsSnapshot::new(0).with("errors", 3.0);

        let mut fired_at = Vec::new();
        for t in (0..=200).step_by(15) {
            for n in engine.evaluate(&snap, t * SEC) {
                if let Notification::Alert(a) = n {
                    fired_at.push(a.fired_at / SEC);
                }
            }
        }
        assert_eq!(fired_at, vec![0, 60, 120, 180]);
        for pair in fired_at.windows(2) {
            assert!(pair[1] - pair[0] >= 60);
        }
    }

    #[test]
    fn missing_metric_skips_rule() {
        let mut engine = AlertEngine::new(vec![cpu_rule()]);
        engine.evaluate(&cpu(95.0, 0), 0);
        let out = engine.evaluate(&MetricsSnapshot::new(0).with("memory", 10.0), 10 * SEC);
        assert!(out.is_empty());
        assert!(engine.state("high_cpu").unwrap().triggered);
    }

    #[test]
    fn recovery_of_unfired_rule_is_marked() {
        let mut engine = AlertEngine::new(vec![cpu_rule()]);
        engine.evaluate(&cpu(95.0, 0), 0);
        let out = engine.evaluate(&cpu(10.0, 0), 10 * SEC);
        match &out[0] {
            Notification::Recovery(r) => assert!(!r.was_firing),
            other => panic!("expected recovery, got {other:?}"),
        }
    }

    #[test]
    fn alert_carries_snapshot_host_and_recommendations() {
        let mut engine = AlertEngine::new(vec![
            AlertRule::new("high_memory", "memory", Operator::Gt, 90.0),
        ])
        .with_host(Some("node-1".into()));
        let out = engine.evaluate(&MetricsSnapshot::new(0).with("memory", 97.0), 0);
        let Notification::Alert(alert) = &out[0] else {
            panic!("expected alert");
        };
        assert_eq!(alert.host.as_deref(), Some("node-1"));
        assert_eq!(alert.snapshot.as_ref().unwrap().number("memory"), Some(97.0));
        assert!(!alert.recommendations.is_empty());
        assert_eq!(alert.message, "memory is 97 (97 > 90)");
    }

    fn aggregating(max_alerts: usize) -> AlertEngine {
        let rules = (0..5)
            .map(|i| AlertRule::new(&format!("r{i}"), &format!("m{i}"), Operator::Gt, 0.0))
            .collect();
        AlertEngine::new(rules).with_aggregation(&AggregationConfig {
            enabled: true,
            window: "5m".into(),
            max_alerts,
        })
    }

    #[test]
    fn aggregation_flushes_on_window() {
        let mut engine = aggregating(10);
        let snap = MetricsSnapshot::new(0).with("m0", 1.0).with("m1", 1.0);
        assert!(engine.evaluate(&snap, 0).is_empty());
        assert_eq!(engine.pending(), 2);

        assert!(engine.flush_due(299 * SEC).is_none());
        let Some(Notification::Grouped(group)) = engine.flush_due(300 * SEC) else {
            panic!("expected grouped flush");
        };
        assert_eq!(group.alerts.len(), 2);
        assert_eq!(group.window_started_at, 0);
        assert_eq!(engine.pending(), 0);
        assert!(engine.flush_due(900 * SEC).is_none());
    }

    #[test]
    fn aggregation_flushes_when_full() {
        let mut engine = aggregating(3);
        let snap = (0..5).fold(MetricsSnapshot::new(0), |s, i| s.with(&format!("m{i}"), 1.0));
        let out = engine.evaluate(&snap, 0);
        assert_eq!(out.len(), 1);
        assert!(matches!(&out[0], Notification::Grouped(g) if g.alerts.len() == 3));
        assert_eq!(engine.pending(), 2);
    }

    #[test]
    fn recovery_bypasses_aggregation() {
        let mut engine = aggregating(10);
        engine.evaluate(&MetricsSnapshot::new(0).with("m0", 1.0), 0);
        assert!(engine.flush(SEC).is_some());
        engine.evaluate(&MetricsSnapshot::new(0).with("m0", 1.0).with("m1", 1.0), 2 * SEC);
        assert_eq!(engine.pending(), 1);

        let out = engine.evaluate(&MetricsSnapshot::new(0).with("m0", 0.0).with("m1", 1.0), 3 * SEC);
        assert_eq!(out.len(), 1);
        assert_eq!(recoveries(&out), 1);
        assert_eq!(engine.pending(), 1);
    }

    #[test]
    fn buffered_alert_is_flushed_before_its_recovery() {
        let mut engine = aggregating(10);
        engine.evaluate(&MetricsSnapshot::new(0).with("m0", 1.0), 0);
        assert_eq!(engine.pending(), 1);

        let out = engine.evaluate(&MetricsSnapshot::new(0).with("m0", 0.0), SEC);
        assert_eq!(out.len(), 2);
        assert!(matches!(&out[0], Notification::Grouped(g) if g.alerts[0].rule_id == "r0"));
        assert!(matches!(&out[1], Notification::Recovery(r) if r.rule_id == "r0" && r.was_firing));
        assert_eq!(engine.pending(), 0);
    }

    #[test]
    fn huge_cooldown_saturates() {
        let rule = AlertRule::new("r", "m", Operator::Gt, 0.0).cooldown(Duration::MAX);
        let mut engine = AlertEngine::new(vec![rule]);
        let out = engine.evaluate(&MetricsSnapshot::new(0).with("m", 1.0), 5 * SEC);
        assert_eq!(alerts(&out), 1);
        assert_eq!(engine.state("r").unwrap().cooldown_until, u64::MAX);
    }

    #[test]
    fn active_lists_triggered_rules() {
        let mut engine = aggregating(10);
        engine.evaluate(&MetricsSnapshot::new(0).with("m3", 1.0).with("m1", 1.0), 0);
        assert_eq!(engine.active(), vec!["r1".to_string(), "r3".to_string()]);
    }
}
