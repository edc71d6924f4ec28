//! fleet.toml configuration parser.
//!
//! Every section has defaults, so an empty file is a valid configuration.
//! Durations are human strings (`"500ms"`, `"30s"`, `"5m"`, `"1h"`) and are
//! checked by [`FleetConfig::validate`]; the typed accessors fall back to
//! the section default if called on an unvalidated config.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::metrics::MetricValue;
use crate::types::{Operator, Severity};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub supervisor: SupervisorConfig,
    pub autoscale: AutoscaleConfig,
    pub health: HealthConfig,
    pub escalation: EscalationConfig,
    pub rollout: RolloutConfig,
    pub alerts: AlertsConfig,
    pub transports: Vec<TransportConfig>,
    pub deployment: DeploymentConfig,
    pub status: StatusConfig,
}

// ── Supervisor ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Program started for every worker.
    pub command: String,
    pub args: Vec<String>,
    /// Extra environment passed to every worker.
    pub env: HashMap<String, String>,
    /// Workers started at boot.
    pub workers: u32,
    pub min_workers: u32,
    pub max_workers: u32,
    /// Restarts allowed per slot within `restart_window`.
    pub max_restarts: u32,
    pub restart_window: String,
    /// Delay before a crashed worker is restarted.
    pub restart_delay: String,
    /// How long a disconnecting worker may take before it is killed.
    pub shutdown_grace: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            command: "fleet-worker".to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            workers: 2,
            min_workers: 1,
            max_workers: 8,
            max_restarts: 5,
            restart_window: "60s".to_string(),
            restart_delay: "1s".to_string(),
            shutdown_grace: "30s".to_string(),
        }
    }
}

impl SupervisorConfig {
    pub fn restart_window(&self) -> Duration {
        parse_duration(&self.restart_window).unwrap_or(Duration::from_secs(60))
    }

    pub fn restart_delay(&self) -> Duration {
        parse_duration(&self.restart_delay).unwrap_or(Duration::from_secs(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        parse_duration(&self.shutdown_grace).unwrap_or(Duration::from_secs(30))
    }
}

// ── Autoscale ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscaleConfig {
    pub enabled: bool,
    pub interval: String,
    pub cooldown: String,
    /// Snapshot paths read for CPU and memory load (percent).
    pub cpu_metric: String,
    pub memory_metric: String,
    pub scale_up_cpu: f64,
    pub scale_up_memory: f64,
    pub scale_down_cpu: f64,
    pub scale_down_memory: f64,
    /// Workers added or removed per action.
    pub step: u32,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: "30s".to_string(),
            cooldown: "5m".to_string(),
            cpu_metric: "cpu".to_string(),
            memory_metric: "memory".to_string(),
            scale_up_cpu: 70.0,
            scale_up_memory: 80.0,
            scale_down_cpu: 30.0,
            scale_down_memory: 40.0,
            step: 1,
        }
    }
}

impl AutoscaleConfig {
    pub fn interval(&self) -> Duration {
        parse_duration(&self.interval).unwrap_or(Duration::from_secs(30))
    }

    pub fn cooldown(&self) -> Duration {
        parse_duration(&self.cooldown).unwrap_or(Duration::from_secs(300))
    }
}

// ── Health ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval: String,
    /// Each probe is raced against this timeout.
    pub probe_timeout: String,
    pub probes: Vec<ProbeConfig>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: "30s".to_string(),
            probe_timeout: "5s".to_string(),
            probes: vec![ProbeConfig {
                name: "pool".to_string(),
                kind: ProbeKind::Pool,
                remediation: None,
            }],
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        parse_duration(&self.interval).unwrap_or(Duration::from_secs(30))
    }

    pub fn probe_timeout(&self) -> Duration {
        parse_duration(&self.probe_timeout).unwrap_or(Duration::from_secs(5))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeConfig {
    pub name: String,
    #[serde(flatten)]
    pub kind: ProbeKind,
    #[serde(default)]
    pub remediation: Option<RemediationConfig>,
}

/// Built-in probe implementations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProbeKind {
    /// GET the URL; 2xx is healthy.
    Http { url: String },
    /// Online workers versus the configured minimum.
    Pool,
    /// Average worker memory (MiB) against a limit.
    Memory { limit_mb: f64 },
}

/// What to do when a check is failing and the system is unhealthy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RemediationConfig {
    /// Recycle the worker using the most memory.
    MemoryPressure,
    /// Open the named resource's circuit breaker.
    OpenBreaker {
        resource: String,
        #[serde(default = "default_breaker_retry")]
        retry_after: String,
    },
}

fn default_breaker_retry() -> String {
    "60s".to_string()
}

// ── Escalation ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    pub warning: u64,
    pub critical: u64,
    pub fatal: u64,
    /// Size of the recent-errors ring buffer.
    pub recent_capacity: usize,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            warning: 10,
            critical: 25,
            fatal: 50,
            recent_capacity: 100,
        }
    }
}

// ── Rollout ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutConfig {
    pub batches: u32,
    /// Pause after each replaced worker.
    pub settle_delay: String,
    /// Pause after each batch before the health gate runs.
    pub soak_period: String,
    pub rollback_on_failure: bool,
    pub history_limit: usize,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            batches: 3,
            settle_delay: "2s".to_string(),
            soak_period: "30s".to_string(),
            rollback_on_failure: true,
            history_limit: 5,
        }
    }
}

impl RolloutConfig {
    pub fn settle_delay(&self) -> Duration {
        parse_duration(&self.settle_delay).unwrap_or(Duration::from_secs(2))
    }

    pub fn soak_period(&self) -> Duration {
        parse_duration(&self.soak_period).unwrap_or(Duration::from_secs(30))
    }
}

// ── Alerts ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    /// Metrics tick interval.
    pub interval: String,
    /// Host label attached to alerts.
    pub host: Option<String>,
    pub delivery_timeout: String,
    pub aggregation: AggregationConfig,
    /// Empty means the built-in default rules.
    pub rules: Vec<AlertRuleConfig>,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            interval: "60s".to_string(),
            host: None,
            delivery_timeout: "10s".to_string(),
            aggregation: AggregationConfig::default(),
            rules: Vec::new(),
        }
    }
}

impl AlertsConfig {
    pub fn interval(&self) -> Duration {
        parse_duration(&self.interval).unwrap_or(Duration::from_secs(60))
    }

    pub fn delivery_timeout(&self) -> Duration {
        parse_duration(&self.delivery_timeout).unwrap_or(Duration::from_secs(10))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub enabled: bool,
    pub window: String,
    pub max_alerts: usize,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window: "5m".to_string(),
            max_alerts: 10,
        }
    }
}

impl AggregationConfig {
    pub fn window(&self) -> Duration {
        parse_duration(&self.window).unwrap_or(Duration::from_secs(300))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertRuleConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub metric: String,
    pub operator: Operator,
    pub threshold: MetricValue,
    #[serde(default = "default_rule_duration")]
    pub duration: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default = "default_rule_cooldown")]
    pub cooldown: String,
}

fn default_rule_duration() -> String {
    "0s".to_string()
}

fn default_rule_cooldown() -> String {
    "15m".to_string()
}

// ── Transports ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(flatten)]
    pub kind: TransportKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportKind {
    /// Write notifications to the log.
    Log,
    /// POST the notification as JSON (chat hooks, generic receivers).
    Webhook { url: String },
    /// Paging endpoint: critical only, with trigger/resolve actions.
    Incident {
        url: String,
        #[serde(default)]
        routing_key: Option<String>,
    },
}

fn default_true() -> bool {
    true
}

// ── Deployment / status ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    /// Version started at boot and target of reload-triggered deploys.
    pub version: String,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            version: "0.0.0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    /// Where the JSON status report is written after each health tick.
    pub path: Option<PathBuf>,
}

// ── Loading ──────────────────────────────────────────────────────

impl FleetConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: FleetConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Check durations, threshold ordering and pool bounds.
    pub fn validate(&self) -> ConfigResult<()> {
        let durations = [
            ("supervisor.restart_window", &self.supervisor.restart_window),
            ("supervisor.restart_delay", &self.supervisor.restart_delay),
            ("supervisor.shutdown_grace", &self.supervisor.shutdown_grace),
            ("autoscale.interval", &self.autoscale.interval),
            ("autoscale.cooldown", &self.autoscale.cooldown),
            ("health.interval", &self.health.interval),
            ("health.probe_timeout", &self.health.probe_timeout),
            ("rollout.settle_delay", &self.rollout.settle_delay),
            ("rollout.soak_period", &self.rollout.soak_period),
            ("alerts.interval", &self.alerts.interval),
            ("alerts.delivery_timeout", &self.alerts.delivery_timeout),
            ("alerts.aggregation.window", &self.alerts.aggregation.window),
        ];
        for (field, value) in durations {
            check_duration(field, value)?;
        }
        for rule in &self.alerts.rules {
            check_duration(&format!("alerts.rules.{}.duration", rule.id), &rule.duration)?;
            check_duration(&format!("alerts.rules.{}.cooldown", rule.id), &rule.cooldown)?;
        }
        for probe in &self.health.probes {
            if let Some(RemediationConfig::OpenBreaker { retry_after, .. }) = &probe.remediation {
                check_duration(&format!("health.probes.{}.retry_after", probe.name), retry_after)?;
            }
        }

        let sup = &self.supervisor;
        if sup.min_workers > sup.max_workers {
            return Err(ConfigError::Invalid(format!(
                "supervisor.min_workers ({}) exceeds max_workers ({})",
                sup.min_workers, sup.max_workers
            )));
        }
        if sup.max_restarts == 0 {
            return Err(ConfigError::Invalid(
                "supervisor.max_restarts must be at least 1".to_string(),
            ));
        }

        let esc = &self.escalation;
        if !(esc.warning < esc.critical && esc.critical < esc.fatal) {
            return Err(ConfigError::Invalid(format!(
                "escalation thresholds must ascend: warning {} < critical {} < fatal {}",
                esc.warning, esc.critical, esc.fatal
            )));
        }
        if esc.recent_capacity == 0 {
            return Err(ConfigError::Invalid(
                "escalation.recent_capacity must be at least 1".to_string(),
            ));
        }

        if self.rollout.batches == 0 {
            return Err(ConfigError::Invalid("rollout.batches must be at least 1".to_string()));
        }
        if self.alerts.aggregation.max_alerts == 0 {
            return Err(ConfigError::Invalid(
                "alerts.aggregation.max_alerts must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

fn check_duration(field: &str, value: &str) -> ConfigResult<()> {
    parse_duration(value).map(|_| ()).ok_or_else(|| ConfigError::Duration {
        field: field.to_string(),
        value: value.to_string(),
    })
}

/// Parse a duration string like "500ms", "5s", "2m", "1h".
///
/// A bare number is seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim()
            .parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.trim()
            .parse::<u64>()
            .ok()
            .and_then(|h| h.checked_mul(3600))
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = FleetConfig::from_toml_str("").unwrap();
        assert_eq!(config.supervisor.workers, 2);
        assert_eq!(config.rollout.batches, 3);
        assert_eq!(config.escalation.fatal, 50);
        assert_eq!(config.health.probes.len(), 1);
        assert!(config.alerts.rules.is_empty());
    }

    #[test]
    fn parses_full_example() {
        let toml_str = r#"
[supervisor]
command = "/usr/bin/worker"
args = ["--port", "9000"]
workers = 4
min_workers = 2
max_workers = 10
max_restarts = 3
restart_window = "60s"

[autoscale]
scale_up_cpu = 75.0
cooldown = "2m"

[[health.probes]]
name = "api"
kind = "http"
url = "http://127.0.0.1:9000/healthz"
remediation = { action = "open_breaker", resource = "api" }

[[health.probes]]
name = "memory"
kind = "memory"
limit_mb = 512.0
remediation = { action = "memory_pressure" }

[escalation]
warning = 5
critical = 10
fatal = 20

[[alerts.rules]]
id = "high_cpu"
metric = "cpu"
operator = ">"
threshold = 80
duration = "5m"
severity = "critical"
cooldown = "15m"

[[transports]]
name = "ops-chat"
kind = "webhook"
url = "http://hooks.internal/ops"

[[transports]]
name = "pager"
kind = "incident"
url = "http://pager.internal/v2/enqueue"
routing_key = "abc"

[deployment]
version = "1.4.2"
"#;
        let config = FleetConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.supervisor.args, vec!["--port", "9000"]);
        assert_eq!(config.supervisor.max_restarts, 3);
        assert_eq!(config.autoscale.cooldown(), Duration::from_secs(120));
        assert_eq!(config.health.probes.len(), 2);
        assert_eq!(
            config.health.probes[0].kind,
            ProbeKind::Http {
                url: "http://127.0.0.1:9000/healthz".to_string()
            }
        );
        assert_eq!(
            config.health.probes[0].remediation,
            Some(RemediationConfig::OpenBreaker {
                resource: "api".to_string(),
                retry_after: "60s".to_string(),
            })
        );
        assert_eq!(config.alerts.rules[0].operator, Operator::Gt);
        assert_eq!(config.alerts.rules[0].threshold, MetricValue::Number(80.0));
        assert_eq!(config.alerts.rules[0].severity, Severity::Critical);
        assert_eq!(config.transports.len(), 2);
        assert!(config.transports[1].enabled);
        assert_eq!(config.deployment.version, "1.4.2");
    }

    #[test]
    fn rejects_bad_duration() {
        let err = FleetConfig::from_toml_str("[supervisor]\nrestart_window = \"soon\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Duration { ref field, .. } if field == "supervisor.restart_window"));
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let err = FleetConfig::from_toml_str("[escalation]\nwarning = 30\ncritical = 20\nfatal = 40\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_min_above_max() {
        let err = FleetConfig::from_toml_str("[supervisor]\nmin_workers = 5\nmax_workers = 2\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn from_file_reads_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.toml");
        std::fs::write(&path, "[deployment]\nversion = \"2.0.0\"\n").unwrap();
        let config = FleetConfig::from_file(&path).unwrap();
        assert_eq!(config.deployment.version, "2.0.0");
    }

    #[test]
    fn missing_file_is_read_error() {
        let err = FleetConfig::from_file(Path::new("/nonexistent/fleet.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn roundtrips_through_toml() {
        let config = FleetConfig::default();
        let text = config.to_toml_string().unwrap();
        let back = FleetConfig::from_toml_str(&text).unwrap();
        assert_eq!(back.supervisor.workers, config.supervisor.workers);
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("10"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("soon"), None);
    }

    #[test]
    fn overflowing_duration_is_rejected() {
        assert_eq!(parse_duration("307445734561825861m"), None);
        assert_eq!(parse_duration("5124095576030432h"), None);
        assert_eq!(
            parse_duration("18446744073709551615s"),
            Some(Duration::from_secs(u64::MAX))
        );

        let mut config = FleetConfig::default();
        config.supervisor.restart_delay = "307445734561825861m".into();
        assert!(config.validate().is_err());
    }
}
