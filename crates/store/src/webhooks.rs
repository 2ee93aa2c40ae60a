//! Webhook configuration plus the per-attempt delivery log.
//!
//! Configs live in `webhooks.json`; every delivery attempt is appended to
//! `webhook_deliveries.jsonl` and kept in a bounded in-memory ring.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use vox_domain::error::{Error, Result};
use vox_domain::webhook::{WebhookConfig, WebhookDelivery};

#[derive(Debug, Clone, serde::Deserialize)]
pub struct WebhookInput {
    pub url: String,
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default = "d_true")]
    pub active: bool,
}

fn d_true() -> bool {
    true
}

pub struct WebhookStore {
    config_path: PathBuf,
    log_path: PathBuf,
    configs: RwLock<HashMap<Uuid, WebhookConfig>>,
    log: RwLock<VecDeque<WebhookDelivery>>,
    log_cap: usize,
}

impl WebhookStore {
    pub fn new(state_path: &Path, log_cap: usize) -> Result<Self> {
        std::fs::create_dir_all(state_path).map_err(Error::Io)?;
        let config_path = state_path.join("webhooks.json");
        let log_path = state_path.join("webhook_deliveries.jsonl");

        let configs = if config_path.exists() {
            let raw = std::fs::read_to_string(&config_path).map_err(Error::Io)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            HashMap::new()
        };

        let mut log = VecDeque::new();
        if let Ok(raw) = std::fs::read_to_string(&log_path) {
            for line in raw.lines() {
                if let Ok(d) = serde_json::from_str::<WebhookDelivery>(line) {
                    log.push_back(d);
                }
            }
            while log.len() > log_cap {
                log.pop_front();
            }
        }

        Ok(Self {
            config_path,
            log_path,
            configs: RwLock::new(configs),
            log: RwLock::new(log),
            log_cap,
        })
    }

    // ── Configs ──────────────────────────────────────────────────────

    pub fn create(&self, input: WebhookInput) -> Result<WebhookConfig> {
        let config = WebhookConfig {
            id: Uuid::new_v4(),
            url: input.url,
            events: input.events,
            secret: input.secret,
            active: input.active,
            created_at: Utc::now(),
        };
        self.configs.write().insert(config.id, config.clone());
        self.flush_configs()?;
        Ok(config)
    }

    pub fn update(&self, id: &Uuid, input: WebhookInput) -> Result<WebhookConfig> {
        let mut configs = self.configs.write();
        let config = configs
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("webhook {id}")))?;
        config.url = input.url;
        config.events = input.events;
        config.secret = input.secret;
        config.active = input.active;
        let updated = config.clone();
        drop(configs);
        self.flush_configs()?;
        Ok(updated)
    }

    pub fn delete(&self, id: &Uuid) -> Result<()> {
        if self.configs.write().remove(id).is_none() {
            return Err(Error::NotFound(format!("webhook {id}")));
        }
        self.flush_configs()
    }

    pub fn get(&self, id: &Uuid) -> Option<WebhookConfig> {
        self.configs.read().get(id).cloned()
    }

    pub fn list(&self) -> Vec<WebhookConfig> {
        let mut all: Vec<WebhookConfig> = self.configs.read().values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    /// Active configs subscribed to an event.
    pub fn matching(&self, event: &str) -> Vec<WebhookConfig> {
        self.configs
            .read()
            .values()
            .filter(|c| c.subscribes_to(event))
            .cloned()
            .collect()
    }

    fn flush_configs(&self) -> Result<()> {
        let configs = self.configs.read();
        let json = serde_json::to_string_pretty(&*configs)?;
        std::fs::write(&self.config_path, json).map_err(Error::Io)?;
        Ok(())
    }

    // ── Delivery log ─────────────────────────────────────────────────

    /// Append one attempt to the ring and the JSONL file.
    pub fn log_delivery(&self, delivery: WebhookDelivery) {
        if let Ok(json) = serde_json::to_string(&delivery) {
            use std::io::Write;
            if let Ok(mut f) = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.log_path)
            {
                let _ = writeln!(f, "{json}");
            }
        }
        let mut log = self.log.write();
        log.push_back(delivery);
        while log.len() > self.log_cap {
            log.pop_front();
        }
    }

    /// Recent attempts for one webhook, newest first.
    pub fn deliveries(&self, webhook_id: &Uuid, limit: usize) -> Vec<WebhookDelivery> {
        self.log
            .read()
            .iter()
            .rev()
            .filter(|d| d.webhook_id == *webhook_id)
            .take(limit)
            .cloned()
            .collect()
    }
}
