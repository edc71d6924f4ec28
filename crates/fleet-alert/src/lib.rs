//! fleet-alert — turns metric snapshots into deduplicated, routed alerts.
//!
//! # Architecture
//!
//! ```text
//! MetricsSnapshot ──▶ AlertManager::on_metrics()
//!                      │
//!                      ├── AlertEngine (sync state machine, explicit `now`)
//!                      │     ├── per-rule RuleState: idle → pending → firing → cooldown
//!                      │     ├── recoveries: sent immediately
//!                      │     └── Aggregator: window / max-count buffer → grouped alert
//!                      │
//!                      └── NotificationDispatcher::send()
//!                            ├── log       (every notification)
//!                            ├── webhook   (JSON POST)
//!                            └── incident  (critical only, trigger / resolve by rule id)
//! ```
//!
//! Delivery is concurrent and failure-isolated: one broken transport never
//! stops the others and `send` never fails as a whole.

pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod manager;
pub mod notification;
pub mod rule;
pub mod transport;

pub use dispatcher::{DispatchReport, NotificationDispatcher};
pub use engine::AlertEngine;
pub use error::{TransportError, TransportResult};
pub use manager::AlertManager;
pub use notification::{Alert, AlertGroup, Notification, Recovery};
pub use rule::{AlertRule, RuleState, default_rules, recommendations};
pub use transport::{IncidentTransport, LogTransport, Transport, WebhookTransport, build_transports};
