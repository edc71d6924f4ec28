//! Metric snapshots.
//!
//! A snapshot is a flat map of dotted names (`cpu`, `workers.online`,
//! `db.pool.waiting`) to string or numeric values. Nested JSON documents
//! are flattened on the way in so every value is addressable by path.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::BoxFuture;

/// A single metric value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Number(f64),
    Text(String),
}

impl MetricValue {
    /// Numeric view of the value. Text that parses as a number counts.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Number(n) => Some(*n),
            MetricValue::Text(s) => s.trim().parse().ok(),
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => {
                write!(f, "{}", *n as i64)
            }
            MetricValue::Number(n) => write!(f, "{n:.2}"),
            MetricValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Number(v)
    }
}

impl From<u64> for MetricValue {
    fn from(v: u64) -> Self {
        MetricValue::Number(v as f64)
    }
}

impl From<&str> for MetricValue {
    fn from(v: &str) -> Self {
        MetricValue::Text(v.to_string())
    }
}

impl From<String> for MetricValue {
    fn from(v: String) -> Self {
        MetricValue::Text(v)
    }
}

/// Point-in-time view of every metric the engine can evaluate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Epoch milliseconds when the snapshot was taken.
    pub taken_at: u64,
    values: BTreeMap<String, MetricValue>,
}

impl MetricsSnapshot {
    pub fn new(taken_at: u64) -> Self {
        Self {
            taken_at,
            values: BTreeMap::new(),
        }
    }

    /// Builder-style insert.
    pub fn with(mut self, path: &str, value: impl Into<MetricValue>) -> Self {
        self.insert(path, value);
        self
    }

    pub fn insert(&mut self, path: &str, value: impl Into<MetricValue>) {
        self.values.insert(path.to_string(), value.into());
    }

    /// Resolve a dotted path. Returns `None` if nothing is recorded there.
    pub fn get(&self, path: &str) -> Option<&MetricValue> {
        self.values.get(path)
    }

    pub fn number(&self, path: &str) -> Option<f64> {
        self.get(path).and_then(MetricValue::as_f64)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &MetricValue)> {
        self.values.iter()
    }

    /// Flatten a JSON document into dotted paths.
    ///
    /// Booleans become `0`/`1`; nulls and arrays are skipped.
    pub fn from_json(taken_at: u64, doc: &serde_json::Value) -> Self {
        let mut snapshot = Self::new(taken_at);
        flatten_into(&mut snapshot.values, "", doc);
        snapshot
    }
}

fn flatten_into(out: &mut BTreeMap<String, MetricValue>, prefix: &str, value: &serde_json::Value) {
    use serde_json::Value;

    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_into(out, &path, child);
            }
        }
        Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                out.insert(prefix.to_string(), MetricValue::Number(f));
            }
        }
        Value::String(s) => {
            out.insert(prefix.to_string(), MetricValue::Text(s.clone()));
        }
        Value::Bool(b) => {
            out.insert(prefix.to_string(), MetricValue::Number(if *b { 1.0 } else { 0.0 }));
        }
        Value::Null | Value::Array(_) => {}
    }
}

/// Anything that can produce a metrics snapshot on demand.
pub trait MetricsSource: Send + Sync {
    fn snapshot(&self) -> BoxFuture<'_, MetricsSnapshot>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flattens_nested_json() {
        let doc = json!({
            "cpu": 42.5,
            "db": { "pool": { "waiting": 3 }, "status": "ok" },
            "ready": true,
            "tags": ["a", "b"],
            "missing": null
        });
        let snap = MetricsSnapshot::from_json(7, &doc);

        assert_eq!(snap.taken_at, 7);
        assert_eq!(snap.number("cpu"), Some(42.5));
        assert_eq!(snap.number("db.pool.waiting"), Some(3.0));
        assert_eq!(snap.get("db.status"), Some(&MetricValue::Text("ok".into())));
        assert_eq!(snap.number("ready"), Some(1.0));
        assert!(snap.get("tags").is_none());
        assert!(snap.get("missing").is_none());
    }

    #[test]
    fn unknown_path_resolves_to_nothing() {
        let snap = MetricsSnapshot::new(0).with("cpu", 10.0);
        assert!(snap.get("memory").is_none());
        assert!(snap.get("cpu.user").is_none());
    }

    #[test]
    fn numeric_text_is_a_number() {
        assert_eq!(MetricValue::from("12.5").as_f64(), Some(12.5));
        assert_eq!(MetricValue::from("degraded").as_f64(), None);
    }

    #[test]
    fn display_trims_whole_numbers() {
        assert_eq!(MetricValue::from(85.0).to_string(), "85");
        assert_eq!(MetricValue::from(85.257).to_string(), "85.26");
    }
}
