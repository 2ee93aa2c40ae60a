use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use vox_domain::config::Config;
use vox_sessions::{GreetingCache, SessionRegistry};
use vox_store::{
    CallStore, CampaignStore, PromptStore, ScheduleStore, SettingsStore, WebhookStore,
};

use crate::dialer::Dialer;
use crate::engine::SessionLauncher;
use crate::runtime::campaigns::CampaignSupervisor;
use crate::runtime::webhooks::WebhookDispatcher;

/// Shared application state passed to all API handlers.
///
/// Fields are grouped by concern:
/// - **Core** — config, session registry, launcher, dialer
/// - **Stores** — the persistence gateway
/// - **Runtime** — campaign supervisor, webhook dispatcher, greeting cache
/// - **Security & counters** — API token hash, unknown-frame counter
#[derive(Clone)]
pub struct AppState {
    // ── Core ──────────────────────────────────────────────────────────
    pub config: Arc<Config>,
    pub registry: Arc<SessionRegistry>,
    pub launcher: Arc<SessionLauncher>,
    pub dialer: Arc<Dialer>,

    // ── Stores ────────────────────────────────────────────────────────
    pub calls: Arc<CallStore>,
    pub prompts: Arc<PromptStore>,
    pub campaigns: Arc<CampaignStore>,
    pub schedules: Arc<ScheduleStore>,
    pub webhooks: Arc<WebhookStore>,
    pub settings: Arc<SettingsStore>,

    // ── Runtime ───────────────────────────────────────────────────────
    pub greetings: Arc<GreetingCache>,
    pub campaign_runner: Arc<CampaignSupervisor>,
    pub dispatcher: Arc<WebhookDispatcher>,

    // ── Security & counters ───────────────────────────────────────────
    /// SHA-256 hash of the API bearer token (read once at startup).
    /// `None` = dev mode (no auth enforced).
    pub api_token_hash: Option<Vec<u8>>,
    /// Unparseable frames received on media sockets, process-wide.
    pub unknown_frames: Arc<AtomicU64>,
}
