use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Switch control channel
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchConfig {
    /// Base URL of the switch's HTTP command channel (originate/hangup).
    #[serde(default = "d_control_url")]
    pub control_url: String,
    /// Env var with the command-channel credential, if the switch needs one.
    #[serde(default = "d_switch_token_env")]
    pub token_env: String,
    /// Caller-id number presented on outbound originations.
    #[serde(default)]
    pub caller_id: String,
    /// Public base URL the switch uses to reach this process's media
    /// endpoint, e.g. `ws://voxline:3100/ws`.
    #[serde(default = "d_media_url")]
    pub media_base_url: String,
    /// Grace window an unmatched media socket waits for its session before
    /// being closed with a policy violation.
    #[serde(default = "d_orphan_grace_secs")]
    pub orphan_grace_secs: u64,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            control_url: d_control_url(),
            token_env: d_switch_token_env(),
            caller_id: String::new(),
            media_base_url: d_media_url(),
            orphan_grace_secs: d_orphan_grace_secs(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_control_url() -> String {
    "http://127.0.0.1:8021".into()
}
fn d_switch_token_env() -> String {
    "VOX_SWITCH_TOKEN".into()
}
fn d_media_url() -> String {
    "ws://127.0.0.1:3100/ws".into()
}
fn d_orphan_grace_secs() -> u64 {
    5
}
