//! What the dispatcher delivers.

use std::collections::BTreeMap;

use serde::Serialize;

use fleet_core::{MetricValue, MetricsSnapshot, Severity};

/// A fired alert.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub rule_id: String,
    pub title: String,
    pub severity: Severity,
    pub message: String,
    /// Epoch milliseconds.
    pub fired_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<MetricValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<MetricsSnapshot>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub recommendations: Vec<String>,
}

impl Alert {
    /// An alert raised directly by a component rather than by a rule.
    pub fn raised(rule_id: &str, severity: Severity, message: impl Into<String>, now: u64) -> Self {
        Self {
            rule_id: rule_id.to_string(),
            title: rule_id.replace('_', " "),
            severity,
            message: message.into(),
            fired_at: now,
            host: None,
            value: None,
            snapshot: None,
            recommendations: Vec::new(),
        }
    }
}

/// A rule whose condition stopped holding.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recovery {
    pub rule_id: String,
    pub title: String,
    /// Severity of the rule that recovered.
    pub previous_severity: Severity,
    /// Whether the rule fired during this trigger episode.
    pub was_firing: bool,
    pub value: MetricValue,
    pub recovered_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

/// Alerts buffered during an aggregation window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertGroup {
    pub severity: Severity,
    pub counts: BTreeMap<Severity, usize>,
    pub window_started_at: u64,
    pub flushed_at: u64,
    pub alerts: Vec<Alert>,
}

impl AlertGroup {
    pub fn new(alerts: Vec<Alert>, window_started_at: u64, flushed_at: u64) -> Self {
        let mut counts = BTreeMap::new();
        for alert in &alerts {
            *counts.entry(alert.severity).or_insert(0) += 1;
        }
        let severity = alerts
            .iter()
            .map(|a| a.severity)
            .max()
            .unwrap_or_default();
        Self {
            severity,
            counts,
            window_started_at,
            flushed_at,
            alerts,
        }
    }

    pub fn messages(&self) -> Vec<&str> {
        self.alerts.iter().map(|a| a.message.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    Alert(Alert),
    Grouped(AlertGroup),
    Recovery(Recovery),
}

impl Notification {
    /// Severity used for routing. Recoveries route as `info`.
    pub fn severity(&self) -> Severity {
        match self {
            Notification::Alert(a) => a.severity,
            Notification::Grouped(g) => g.severity,
            Notification::Recovery(_) => Severity::Info,
        }
    }

    /// Incident dedup key: the originating rule id.
    pub fn dedup_key(&self) -> String {
        match self {
            Notification::Alert(a) => a.rule_id.clone(),
            Notification::Grouped(g) => format!("group-{}", g.window_started_at),
            Notification::Recovery(r) => r.rule_id.clone(),
        }
    }

    /// One-line human summary.
    pub fn summary(&self) -> String {
        match self {
            Notification::Alert(a) => {
                format!("[{}] {}: {}", a.severity.as_str().to_uppercase(), a.title, a.message)
            }
            Notification::Grouped(g) => {
                let counts: Vec<String> = g
                    .counts
                    .iter()
                    .rev()
                    .map(|(sev, n)| format!("{n} {sev}"))
                    .collect();
                format!(
                    "[{}] {} alerts ({})",
                    g.severity.as_str().to_uppercase(),
                    g.alerts.len(),
                    counts.join(", ")
                )
            }
            Notification::Recovery(r) => {
                format!("[RESOLVED] {}: back to normal at {}", r.title, r.value)
            }
        }
    }
}
