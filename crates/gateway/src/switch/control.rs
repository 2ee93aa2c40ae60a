//! The switch's out-of-band command channel.
//!
//! The concrete dialect is pluggable behind a two-method trait; the
//! default adapter speaks a plain HTTP command API: the switch originates
//! a call and, on answer, connects its media stream to our
//! `/ws/{call_id}` endpoint.

use vox_domain::config::SwitchConfig;
use vox_domain::error::{Error, Result};

#[async_trait::async_trait]
pub trait SwitchControl: Send + Sync {
    /// Place an outbound call whose answered media lands on
    /// `/ws/{call_id}`. Returns when the switch accepts the command.
    async fn originate(&self, number: &str, call_id: &str) -> Result<()>;

    /// Tear down the switch leg of a call.
    async fn hangup(&self, call_id: &str) -> Result<()>;
}

pub struct HttpSwitchControl {
    base_url: String,
    token: String,
    caller_id: String,
    media_base_url: String,
    client: reqwest::Client,
}

impl HttpSwitchControl {
    pub fn new(cfg: &SwitchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .map_err(|e| Error::Switch(e.to_string()))?;
        Ok(Self {
            base_url: cfg.control_url.trim_end_matches('/').to_string(),
            token: std::env::var(&cfg.token_env).unwrap_or_default(),
            caller_id: cfg.caller_id.clone(),
            media_base_url: cfg.media_base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn command(&self, path: &str, body: serde_json::Value) -> Result<()> {
        let url = format!("{}/{path}", self.base_url);
        let mut req = self.client.post(&url).json(&body);
        if !self.token.is_empty() {
            req = req.bearer_auth(&self.token);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| Error::Switch(format!("{path}: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::Switch(format!(
                "{path} rejected: HTTP {} - {text}",
                status.as_u16()
            )));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl SwitchControl for HttpSwitchControl {
    async fn originate(&self, number: &str, call_id: &str) -> Result<()> {
        tracing::info!(call_id = %call_id, number = %number, "originating");
        self.command(
            "originate",
            serde_json::json!({
                "destination": number,
                "caller_id": self.caller_id,
                "call_id": call_id,
                "media_url": format!("{}/{}", self.media_base_url, call_id),
            }),
        )
        .await
    }

    async fn hangup(&self, call_id: &str) -> Result<()> {
        self.command("hangup", serde_json::json!({ "call_id": call_id }))
            .await
    }
}
