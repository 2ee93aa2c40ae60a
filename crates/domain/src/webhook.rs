//! Webhook configuration and per-attempt delivery log entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub id: Uuid,
    pub url: String,
    /// Subscribed event names (`call.started`, ...). Empty means all events.
    #[serde(default)]
    pub events: Vec<String>,
    /// When set, deliveries carry `X-Webhook-Signature: sha256=<hex>`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default = "d_true")]
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

fn d_true() -> bool {
    true
}

impl WebhookConfig {
    pub fn subscribes_to(&self, event: &str) -> bool {
        self.active && (self.events.is_empty() || self.events.iter().any(|e| e == event))
    }
}

/// One delivery attempt, logged whether it succeeded or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: Uuid,
    pub webhook_id: Uuid,
    pub event: String,
    /// 1-based attempt ordinal.
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub delivered_at: DateTime<Utc>,
}
