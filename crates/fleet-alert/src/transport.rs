//! Notification transports.
//!
//! Every transport implements [`Transport`]. The HTTP-based ones share a
//! small hyper http1 client: connect, handshake, POST one JSON document,
//! accept any 2xx.

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use serde_json::json;
use tracing::{error, info, warn};

use fleet_core::config::{TransportConfig, TransportKind};
use fleet_core::{BoxFuture, HttpTarget, Severity};

use crate::error::{TransportError, TransportResult};
use crate::notification::Notification;

pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    fn enabled(&self) -> bool {
        true
    }

    /// Paging transports only receive critical notifications.
    fn critical_only(&self) -> bool {
        false
    }

    fn deliver<'a>(&'a self, notification: &'a Notification) -> BoxFuture<'a, TransportResult<()>>;

    /// Resolve a previously triggered incident. No-op by default.
    fn resolve<'a>(&'a self, _dedup_key: &'a str) -> BoxFuture<'a, TransportResult<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Build transports from config, in declaration order.
pub fn build_transports(configs: &[TransportConfig]) -> TransportResult<Vec<Arc<dyn Transport>>> {
    let mut out: Vec<Arc<dyn Transport>> = Vec::with_capacity(configs.len());
    for cfg in configs {
        let transport: Arc<dyn Transport> = match &cfg.kind {
            TransportKind::Log => Arc::new(LogTransport::new(&cfg.name).with_enabled(cfg.enabled)),
            TransportKind::Webhook { url } => {
                Arc::new(WebhookTransport::new(&cfg.name, url)?.with_enabled(cfg.enabled))
            }
            TransportKind::Incident { url, routing_key } => Arc::new(
                IncidentTransport::new(&cfg.name, url, routing_key.clone())?.with_enabled(cfg.enabled),
            ),
        };
        out.push(transport);
    }
    Ok(out)
}

// ── Log ──────────────────────────────────────────────────────────

/// Writes every notification to the log at a level matching its severity.
pub struct LogTransport {
    name: String,
    enabled: bool,
}

impl LogTransport {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            enabled: true,
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

impl Transport for LogTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn deliver<'a>(&'a self, notification: &'a Notification) -> BoxFuture<'a, TransportResult<()>> {
        Box::pin(async move {
            let summary = notification.summary();
            match notification.severity() {
                Severity::Critical => error!(transport = %self.name, "{summary}"),
                Severity::Warning => warn!(transport = %self.name, "{summary}"),
                Severity::Info => info!(transport = %self.name, "{summary}"),
            }
            Ok(())
        })
    }
}

// ── HTTP plumbing ────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Endpoint(HttpTarget);

impl Endpoint {
    fn parse(url: &str) -> TransportResult<Self> {
        HttpTarget::parse(url)
            .map(Self)
            .map_err(|e| TransportError::InvalidUrl {
                url: url.to_string(),
                reason: e.to_string(),
            })
    }

    async fn post_json(&self, body: &serde_json::Value) -> TransportResult<()> {
        let payload = serde_json::to_vec(body)?;

        let stream = tokio::net::TcpStream::connect(&self.0.address)
            .await
            .map_err(|source| TransportError::Connect {
                address: self.0.address.clone(),
                source,
            })?;
        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method("POST")
            .uri(&self.0.path)
            .header("host", &self.0.address)
            .header("content-type", "application/json")
            .header("user-agent", "fleetgrid-alert/0.1")
            .body(Full::new(Bytes::from(payload)))?;

        let resp = sender.send_request(req).await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(TransportError::Status(resp.status().as_u16()))
        }
    }
}

// ── Webhook ──────────────────────────────────────────────────────

/// POSTs `{"text": <summary>, "notification": {...}}`.
///
/// The `text` field is what chat webhooks render; generic receivers get
/// the full notification alongside it.
pub struct WebhookTransport {
    name: String,
    enabled: bool,
    endpoint: Endpoint,
}

impl WebhookTransport {
    pub fn new(name: &str, url: &str) -> TransportResult<Self> {
        Ok(Self {
            name: name.to_string(),
            enabled: true,
            endpoint: Endpoint::parse(url)?,
        })
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn url(&self) -> &str {
        &self.endpoint.0.url
    }
}

impl Transport for WebhookTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn deliver<'a>(&'a self, notification: &'a Notification) -> BoxFuture<'a, TransportResult<()>> {
        Box::pin(async move {
            let body = json!({
                "text": notification.summary(),
                "notification": notification,
            });
            self.endpoint.post_json(&body).await
        })
    }
}

// ── Incident ─────────────────────────────────────────────────────

/// Paging endpoint. Receives only critical notifications and resolves
/// incidents by rule id when the rule recovers.
pub struct IncidentTransport {
    name: String,
    enabled: bool,
    endpoint: Endpoint,
    routing_key: Option<String>,
}

impl IncidentTransport {
    pub fn new(name: &str, url: &str, routing_key: Option<String>) -> TransportResult<Self> {
        Ok(Self {
            name: name.to_string(),
            enabled: true,
            endpoint: Endpoint::parse(url)?,
            routing_key,
        })
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    fn trigger_body(&self, notification: &Notification) -> serde_json::Value {
        let source = match notification {
            Notification::Alert(a) => a.host.clone(),
            _ => None,
        };
        json!({
            "routing_key": self.routing_key,
            "event_action": "trigger",
            "dedup_key": notification.dedup_key(),
            "payload": {
                "summary": notification.summary(),
                "severity": notification.severity().as_str(),
                "source": source.unwrap_or_else(|| "fleetgrid".to_string()),
                "custom_details": notification,
            },
        })
    }

    fn resolve_body(&self, dedup_key: &str) -> serde_json::Value {
        json!({
            "routing_key": self.routing_key,
            "event_action": "resolve",
            "dedup_key": dedup_key,
        })
    }
}

impl Transport for IncidentTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn critical_only(&self) -> bool {
        true
    }

    fn deliver<'a>(&'a self, notification: &'a Notification) -> BoxFuture<'a, TransportResult<()>> {
        Box::pin(async move { self.endpoint.post_json(&self.trigger_body(notification)).await })
    }

    fn resolve<'a>(&'a self, dedup_key: &'a str) -> BoxFuture<'a, TransportResult<()>> {
        Box::pin(async move { self.endpoint.post_json(&self.resolve_body(dedup_key)).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::Alert;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Accept one request, answer with `status`, return the request body.
    async fn one_shot_server(status: u16) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/hook", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf).to_string();
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .lines()
                        .find_map(|l| {
                            let (k, v) = l.split_once(':')?;
                            k.eq_ignore_ascii_case("content-length")
                                .then(|| v.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if buf.len() >= end + 4 + length {
                        break;
                    }
                }
            }
            let reply = format!("HTTP/1.1 {status} X\r\ncontent-length: 0\r\n\r\n");
            socket.write_all(reply.as_bytes()).await.unwrap();
            let text = String::from_utf8_lossy(&buf).to_string();
            text.split_once("\r\n\r\n").map(|(_, b)| b.to_string()).unwrap_or_default()
        });
        (url, handle)
    }

    fn critical() -> Notification {
        Notification::Alert(Alert::raised("high_memory", Severity::Critical, "memory at 97%", 1))
    }

    #[test]
    fn https_endpoint_is_invalid_url() {
        match Endpoint::parse("https://hooks.slack.com/x") {
            Err(TransportError::InvalidUrl { reason, .. }) => {
                assert_eq!(reason, "only http:// endpoints are supported")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn builds_from_config() {
        let configs = vec![
            TransportConfig {
                name: "log".into(),
                enabled: true,
                kind: TransportKind::Log,
            },
            TransportConfig {
                name: "pager".into(),
                enabled: false,
                kind: TransportKind::Incident {
                    url: "http://127.0.0.1:9/enqueue".into(),
                    routing_key: Some("abc".into()),
                },
            },
        ];
        let transports = build_transports(&configs).unwrap();
        assert_eq!(transports.len(), 2);
        assert_eq!(transports[1].name(), "pager");
        assert!(transports[1].critical_only());
        assert!(!transports[1].enabled());
    }

    #[tokio::test]
    async fn webhook_posts_summary_and_payload() {
        let (url, server) = one_shot_server(200).await;
        let hook = WebhookTransport::new("chat", &url).unwrap();
        hook.deliver(&critical()).await.unwrap();

        let body: serde_json::Value = serde_json::from_str(&server.await.unwrap()).unwrap();
        assert_eq!(body["text"], "[CRITICAL] high memory: memory at 97%");
        assert_eq!(body["notification"]["type"], "alert");
    }

    #[tokio::test]
    async fn webhook_non_2xx_is_an_error() {
        let (url, server) = one_shot_server(503).await;
        let hook = WebhookTransport::new("chat", &url).unwrap();
        let err = hook.deliver(&critical()).await.unwrap_err();
        assert!(matches!(err, TransportError::Status(503)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn incident_trigger_and_resolve_share_dedup_key() {
        let (url, server) = one_shot_server(202).await;
        let pager = IncidentTransport::new("pager", &url, Some("key-1".into())).unwrap();
        pager.deliver(&critical()).await.unwrap();
        let trigger: serde_json::Value = serde_json::from_str(&server.await.unwrap()).unwrap();
        assert_eq!(trigger["event_action"], "trigger");
        assert_eq!(trigger["dedup_key"], "high_memory");
        assert_eq!(trigger["routing_key"], "key-1");
        assert_eq!(trigger["payload"]["severity"], "critical");

        let (url, server) = one_shot_server(202).await;
        let pager = IncidentTransport::new("pager", &url, Some("key-1".into())).unwrap();
        pager.resolve("high_memory").await.unwrap();
        let resolve: serde_json::Value = serde_json::from_str(&server.await.unwrap()).unwrap();
        assert_eq!(resolve["event_action"], "resolve");
        assert_eq!(resolve["dedup_key"], "high_memory");
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_connect_error() {
        let hook = WebhookTransport::new("chat", "http://127.0.0.1:1/x").unwrap();
        let err = hook.deliver(&critical()).await.unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
    }
}
