//! Health probe logic.
//!
//! A probe answers "is this dependency fine?" with a status and an
//! optional message. `run_probe` wraps any probe with the monitor's
//! timeout and turns errors into `unhealthy` results.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use fleet_core::{BoxFuture, Clock, HealthStatus, HttpTarget};

/// What a probe reports when it completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub status: HealthStatus,
    pub message: Option<String>,
}

impl ProbeOutcome {
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            message: None,
        }
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Degraded,
            message: Some(message.into()),
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
        }
    }
}

/// An async health check. Errors are recorded as `unhealthy`.
pub trait Probe: Send + Sync {
    fn check(&self) -> BoxFuture<'_, anyhow::Result<ProbeOutcome>>;
}

/// Result of the latest run of one probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthCheckResult {
    pub check_name: String,
    pub status: HealthStatus,
    pub message: Option<String>,
    pub duration_ms: u64,
    /// Epoch milliseconds.
    pub last_checked_at: u64,
}

/// Run one probe, raced against `timeout`.
pub async fn run_probe(
    name: &str,
    probe: Arc<dyn Probe>,
    timeout: Duration,
    clock: &dyn Clock,
) -> HealthCheckResult {
    let started = Instant::now();
    let outcome = tokio::time::timeout(timeout, probe.check()).await;
    let duration_ms = started.elapsed().as_millis() as u64;

    let (status, message) = match outcome {
        Ok(Ok(outcome)) => (outcome.status, outcome.message),
        Ok(Err(e)) => {
            debug!(check = %name, error = %e, "health probe failed");
            (HealthStatus::Unhealthy, Some(format!("probe failed: {e}")))
        }
        Err(_) => {
            debug!(check = %name, timeout_ms = timeout.as_millis() as u64, "health probe timed out");
            (
                HealthStatus::Unhealthy,
                Some(format!("probe timed out after {}ms", timeout.as_millis())),
            )
        }
    };

    HealthCheckResult {
        check_name: name.to_string(),
        status,
        message,
        duration_ms,
        last_checked_at: clock.now_millis(),
    }
}

// ── Closure probe ────────────────────────────────────────────────

type ProbeFn = dyn Fn() -> BoxFuture<'static, anyhow::Result<ProbeOutcome>> + Send + Sync;

/// A probe backed by a closure.
pub struct FnProbe {
    f: Arc<ProbeFn>,
}

impl FnProbe {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, anyhow::Result<ProbeOutcome>> + Send + Sync + 'static,
    {
        Self { f: Arc::new(f) }
    }
}

impl Probe for FnProbe {
    fn check(&self) -> BoxFuture<'_, anyhow::Result<ProbeOutcome>> {
        (self.f)()
    }
}

// ── HTTP probe ───────────────────────────────────────────────────

/// GETs a URL; 2xx is healthy, anything else unhealthy.
///
/// Connection and handshake failures are errors, which the monitor
/// records as unhealthy.
pub struct HttpProbe {
    target: HttpTarget,
}

impl HttpProbe {
    /// Build a probe for a plain `http://host:port/path` URL.
    pub fn new(url: &str) -> anyhow::Result<Self> {
        let target = HttpTarget::parse(url)
            .map_err(|e| anyhow::anyhow!("invalid health probe url {url}: {e}"))?;
        Ok(Self { target })
    }

    pub fn address(&self) -> &str {
        &self.target.address
    }

    pub fn path(&self) -> &str {
        &self.target.path
    }
}

impl Probe for HttpProbe {
    fn check(&self) -> BoxFuture<'_, anyhow::Result<ProbeOutcome>> {
        Box::pin(async move {
            let stream = tokio::net::TcpStream::connect(self.address()).await?;
            let io = hyper_util::rt::TokioIo::new(stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

            // Drive the connection in the background.
            tokio::spawn(async move {
                let _ = conn.await;
            });

            let req = http::Request::builder()
                .method("GET")
                .uri(self.path())
                .header("host", self.address())
                .header("user-agent", "fleetgrid-health/0.1")
                .body(http_body_util::Empty::<bytes::Bytes>::new())?;

            let resp = sender.send_request(req).await?;
            if resp.status().is_success() {
                Ok(ProbeOutcome::healthy())
            } else {
                debug!(status = %resp.status(), uri = %self.target.url, "health probe non-2xx");
                Ok(ProbeOutcome::unhealthy(format!(
                    "{} returned {}",
                    self.target.url,
                    resp.status()
                )))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::ManualClock;

    fn probe_from(outcome: anyhow::Result<ProbeOutcome>) -> Arc<dyn Probe> {
        let outcome = Arc::new(std::sync::Mutex::new(Some(outcome)));
        Arc::new(FnProbe::new(move || {
            let outcome = outcome.clone();
            Box::pin(async move {
                outcome
                    .lock()
                    .unwrap()
                    .take()
                    .unwrap_or_else(|| Ok(ProbeOutcome::healthy()))
            })
        }))
    }

    #[tokio::test]
    async fn healthy_probe_records_healthy() {
        let clock = ManualClock::new(5_000);
        let result = run_probe(
            "db",
            probe_from(Ok(ProbeOutcome::healthy())),
            Duration::from_secs(1),
            &clock,
        )
        .await;
        assert_eq!(result.check_name, "db");
        assert_eq!(result.status, HealthStatus::Healthy);
        assert_eq!(result.last_checked_at, 5_000);
    }

    #[tokio::test]
    async fn failing_probe_records_unhealthy_with_message() {
        let clock = ManualClock::new(0);
        let result = run_probe(
            "db",
            probe_from(Err(anyhow::anyhow!("connection refused"))),
            Duration::from_secs(1),
            &clock,
        )
        .await;
        assert_eq!(result.status, HealthStatus::Unhealthy);
        assert!(result.message.unwrap().contains("connection refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_probe_times_out_as_unhealthy() {
        let clock = ManualClock::new(0);
        let hung: Arc<dyn Probe> = Arc::new(FnProbe::new(|| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(ProbeOutcome::healthy())
            })
        }));
        let result = run_probe("slow", hung, Duration::from_millis(200), &clock).await;
        assert_eq!(result.status, HealthStatus::Unhealthy);
        assert!(result.message.unwrap().contains("timed out after 200ms"));
    }

    #[test]
    fn http_probe_dials_host_and_port() {
        let probe = HttpProbe::new("http://127.0.0.1:9000/healthz?full=1").unwrap();
        assert_eq!(probe.address(), "127.0.0.1:9000");
        assert_eq!(probe.path(), "/healthz?full=1");
        assert!(HttpProbe::new("https://example.com/health").is_err());
    }

    #[tokio::test]
    async fn http_probe_to_closed_port_is_unhealthy() {
        let clock = ManualClock::new(0);
        let probe: Arc<dyn Probe> = Arc::new(HttpProbe::new("http://127.0.0.1:1/healthz").unwrap());
        let result = run_probe("api", probe, Duration::from_millis(500), &clock).await;
        assert_eq!(result.status, HealthStatus::Unhealthy);
    }
}
