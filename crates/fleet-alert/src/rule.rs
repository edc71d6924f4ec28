//! Alert rules and their per-rule state.

use std::time::Duration;

use serde::Serialize;

use fleet_core::config::AlertRuleConfig;
use fleet_core::{MetricValue, Operator, Severity, parse_duration};

/// Immutable threshold rule.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertRule {
    pub id: String,
    pub name: String,
    /// Dotted path into the metrics snapshot.
    pub metric: String,
    pub operator: Operator,
    pub threshold: MetricValue,
    /// How long the condition must hold before firing.
    pub duration: Duration,
    pub severity: Severity,
    /// Minimum spacing between two fires.
    pub cooldown: Duration,
}

impl AlertRule {
    pub fn new(id: &str, metric: &str, operator: Operator, threshold: impl Into<MetricValue>) -> Self {
        Self {
            id: id.to_string(),
            name: id.replace('_', " "),
            metric: metric.to_string(),
            operator,
            threshold: threshold.into(),
            duration: Duration::ZERO,
            severity: Severity::Info,
            cooldown: Duration::from_secs(15 * 60),
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn lasting(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Build from a validated config entry.
    pub fn from_config(cfg: &AlertRuleConfig) -> Self {
        Self {
            id: cfg.id.clone(),
            name: cfg.name.clone().unwrap_or_else(|| cfg.id.replace('_', " ")),
            metric: cfg.metric.clone(),
            operator: cfg.operator,
            threshold: cfg.threshold.clone(),
            duration: parse_duration(&cfg.duration).unwrap_or(Duration::ZERO),
            severity: cfg.severity,
            cooldown: parse_duration(&cfg.cooldown).unwrap_or(Duration::from_secs(15 * 60)),
        }
    }

    /// Whether `value` satisfies the rule's condition.
    pub fn matches(&self, value: &MetricValue) -> bool {
        compare(self.operator, value, &self.threshold)
    }

    pub fn describe(&self, value: &MetricValue) -> String {
        format!(
            "{} is {} ({} {} {})",
            self.metric, value, value, self.operator, self.threshold
        )
    }
}

/// Numbers compare numerically; anything else only supports `==` / `!=`
/// on the textual form.
pub fn compare(op: Operator, value: &MetricValue, threshold: &MetricValue) -> bool {
    if let (Some(v), Some(t)) = (value.as_f64(), threshold.as_f64()) {
        return match op {
            Operator::Gt => v > t,
            Operator::Lt => v < t,
            Operator::Ge => v >= t,
            Operator::Le => v <= t,
            Operator::Eq => v == t,
            Operator::Ne => v != t,
        };
    }

    let (v, t) = (value.to_string(), threshold.to_string());
    match op {
        Operator::Eq => v == t,
        Operator::Ne => v != t,
        _ => false,
    }
}

/// Mutable state kept per rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RuleState {
    pub triggered: bool,
    pub first_triggered_at: Option<u64>,
    pub last_fired_at: Option<u64>,
    /// Epoch millis; no fire before this.
    pub cooldown_until: u64,
    pub current_value: Option<MetricValue>,
}

impl RuleState {
    /// Fired at least once since the current trigger began.
    pub fn fired_this_episode(&self) -> bool {
        match (self.first_triggered_at, self.last_fired_at) {
            (Some(first), Some(fired)) => fired >= first,
            _ => false,
        }
    }
}

/// Rules used when the configuration declares none.
pub fn default_rules() -> Vec<AlertRule> {
    const MINUTE: u64 = 60;
    vec![
        AlertRule::new("high_cpu", "cpu", Operator::Gt, 80.0)
            .named("High CPU usage")
            .lasting(Duration::from_secs(5 * MINUTE))
            .severity(Severity::Warning)
            .cooldown(Duration::from_secs(15 * MINUTE)),
        AlertRule::new("high_memory", "memory", Operator::Gt, 90.0)
            .named("High memory usage")
            .lasting(Duration::from_secs(5 * MINUTE))
            .severity(Severity::Critical)
            .cooldown(Duration::from_secs(15 * MINUTE)),
        AlertRule::new("error_rate", "errors.recent", Operator::Ge, 10.0)
            .named("Elevated error rate")
            .lasting(Duration::from_secs(MINUTE))
            .severity(Severity::Warning)
            .cooldown(Duration::from_secs(10 * MINUTE)),
        AlertRule::new("worker_crashes", "workers.crashes", Operator::Ge, 3.0)
            .named("Worker crash burst")
            .severity(Severity::Critical)
            .cooldown(Duration::from_secs(10 * MINUTE)),
        AlertRule::new("unhealthy", "health.status", Operator::Eq, "unhealthy")
            .named("System unhealthy")
            .lasting(Duration::from_secs(MINUTE))
            .severity(Severity::Critical)
            .cooldown(Duration::from_secs(30 * MINUTE)),
    ]
}

/// Fixed remediation advice keyed by rule id.
pub fn recommendations(rule_id: &str) -> &'static [&'static str] {
    match rule_id {
        "high_cpu" => &[
            "Check for runaway requests or hot loops in the busiest worker",
            "Raise autoscale.max_workers if load is legitimate",
        ],
        "high_memory" => &[
            "Look for leaks in the worker with the highest resident memory",
            "Recycle the heaviest worker",
            "Lower per-worker cache sizes",
        ],
        "error_rate" => &[
            "Inspect the recent error tail in the status report",
            "Check downstream dependencies for outages",
        ],
        "worker_crashes" => &[
            "Inspect worker stderr for panics or fatal errors",
            "Roll back the last deployment if crashes started after it",
        ],
        "unhealthy" => &[
            "Review failing health checks in the status report",
            "Check circuit breakers for degraded resources",
        ],
        _ => &[],
    }
}
