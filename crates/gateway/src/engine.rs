//! Session launching: provider wiring, prompt snapshot resolution, and
//! greeting pre-synthesis.
//!
//! Providers are built from config plus the settings overlay and held as
//! an atomically swappable set; each call captures the set current at its
//! admission, so a settings reload never disturbs in-flight calls.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use uuid::Uuid;

use vox_domain::call::{CallDirection, CallOrigin, PromptSnapshot};
use vox_domain::config::Config;
use vox_domain::error::{Error, Result};
use vox_domain::prompt::Prompt;
use vox_domain::stream::TtsEvent;
use vox_providers::llm::OpenAiChatClient;
use vox_providers::stt::WsSttClient;
use vox_providers::tts::HttpTtsClient;
use vox_providers::{LlmProvider, SttProvider, TtsProvider};
use vox_sessions::fsm::{spawn_session, SessionCtx};
use vox_sessions::journal::CallJournal;
use vox_sessions::{GreetingCache, SessionRegistry};
use vox_store::{PromptStore, SettingsStore};

/// One immutable generation of provider adapters.
pub struct ProviderSet {
    pub stt: Arc<dyn SttProvider>,
    pub llm: Arc<dyn LlmProvider>,
    pub tts: Arc<dyn TtsProvider>,
}

pub struct SessionLauncher {
    config: Arc<Config>,
    registry: Arc<SessionRegistry>,
    journal: Arc<dyn CallJournal>,
    settings: Arc<SettingsStore>,
    prompts: Arc<PromptStore>,
    greetings: Arc<GreetingCache>,
    providers: RwLock<Arc<ProviderSet>>,
}

impl SessionLauncher {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<SessionRegistry>,
        journal: Arc<dyn CallJournal>,
        settings: Arc<SettingsStore>,
        prompts: Arc<PromptStore>,
        greetings: Arc<GreetingCache>,
    ) -> Result<Self> {
        let providers = Arc::new(build_provider_set(&config, &settings)?);
        Ok(Self {
            config,
            registry,
            journal,
            settings,
            prompts,
            greetings,
            providers: RwLock::new(providers),
        })
    }

    /// Swap in a fresh provider generation (after a settings change).
    /// In-flight calls keep the set they started with.
    pub fn rebuild_providers(&self) -> Result<()> {
        let next = Arc::new(build_provider_set(&self.config, &self.settings)?);
        *self.providers.write() = next;
        tracing::info!("provider set rebuilt");
        Ok(())
    }

    fn providers(&self) -> Arc<ProviderSet> {
        self.providers.read().clone()
    }

    // ── Prompt resolution ────────────────────────────────────────────

    /// Resolve the prompt snapshot for a new call: an explicit prompt id,
    /// else the active prompt, else config/settings defaults.
    pub fn resolve_prompt(&self, prompt_id: Option<Uuid>) -> Result<PromptSnapshot> {
        if let Some(id) = prompt_id {
            let prompt = self
                .prompts
                .get(&id)
                .ok_or_else(|| Error::NotFound(format!("prompt {id}")))?;
            return Ok(prompt.snapshot());
        }
        if let Some(active) = self.prompts.active() {
            return Ok(active.snapshot());
        }
        Ok(self.default_snapshot())
    }

    fn default_snapshot(&self) -> PromptSnapshot {
        PromptSnapshot {
            system_text: "You are a helpful assistant on a phone call. Keep answers \
                          short and conversational."
                .into(),
            voice_id: self
                .settings
                .get("tts.voice_id")
                .unwrap_or_else(|| self.config.tts.default_voice_id.clone()),
            model: self
                .settings
                .get("llm.model")
                .unwrap_or_else(|| self.config.llm.default_model.clone()),
            temperature: self.config.llm.default_temperature,
            greeting: None,
        }
    }

    // ── Launching ────────────────────────────────────────────────────

    pub fn start_outbound(
        &self,
        call_id: &str,
        number: &str,
        prompt: PromptSnapshot,
        origin: CallOrigin,
        campaign_cap: Option<u32>,
    ) -> Result<()> {
        let providers = self.providers();
        let ctx = SessionCtx {
            call_id: call_id.to_string(),
            direction: CallDirection::Outbound,
            origin,
            caller: self.config.switch.caller_id.clone(),
            called: number.to_string(),
            prompt,
            cfg: self.config.engine.clone(),
            stt: providers.stt.clone(),
            llm: providers.llm.clone(),
            tts: providers.tts.clone(),
            journal: self.journal.clone(),
            greetings: self.greetings.clone(),
        };
        spawn_session(ctx, self.registry.clone(), campaign_cap)
    }

    /// Inbound leg announced by the switch's metadata frame; uses the
    /// active prompt.
    pub fn start_inbound(&self, call_id: &str, caller: String, called: String) -> Result<()> {
        let prompt = self.resolve_prompt(None)?;
        let providers = self.providers();
        let ctx = SessionCtx {
            call_id: call_id.to_string(),
            direction: CallDirection::Inbound,
            origin: CallOrigin::Switch,
            caller,
            called,
            prompt,
            cfg: self.config.engine.clone(),
            stt: providers.stt.clone(),
            llm: providers.llm.clone(),
            tts: providers.tts.clone(),
            journal: self.journal.clone(),
            greetings: self.greetings.clone(),
        };
        spawn_session(ctx, self.registry.clone(), None)
    }

    // ── Greeting pre-synthesis ───────────────────────────────────────

    /// Synthesize a prompt's greeting into the process-wide cache so the
    /// first caller hears it without a provider round-trip. Returns the
    /// measured duration.
    pub async fn presynthesize_greeting(&self, prompt: &Prompt) -> Result<u64> {
        let Some(text) = prompt.greeting.as_deref().filter(|g| !g.trim().is_empty())
        else {
            return Ok(0);
        };
        if self.greetings.get(&prompt.voice_id, text).is_some() {
            return Ok(0);
        }

        let providers = self.providers();
        let stream = providers.tts.synthesize(&prompt.voice_id).await?;
        let mut events = stream.events;
        let text_tx = stream.text;
        let _ = text_tx.send(text.to_string()).await;
        drop(text_tx);

        let mut frames = Vec::new();
        while let Some(ev) = recv_bounded(&mut events).await {
            match ev {
                TtsEvent::Frame { pcm } => frames.push(pcm),
                TtsEvent::Done => break,
                TtsEvent::Error { message } => {
                    return Err(Error::Provider {
                        provider: "tts".into(),
                        message,
                    })
                }
            }
        }
        let duration_ms = frames.len() as u64 * vox_domain::audio::FRAME_MS;
        self.greetings.insert(&prompt.voice_id, text, frames);
        tracing::info!(
            prompt = %prompt.name,
            duration_ms,
            "greeting pre-synthesized"
        );
        Ok(duration_ms)
    }
}

async fn recv_bounded(events: &mut mpsc::Receiver<TtsEvent>) -> Option<TtsEvent> {
    tokio::time::timeout(std::time::Duration::from_secs(30), events.recv())
        .await
        .ok()
        .flatten()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Provider construction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn build_provider_set(config: &Config, settings: &SettingsStore) -> Result<ProviderSet> {
    let stt_key = settings.api_key("stt.api_key", &config.stt.api_key_env);
    let llm_key = settings.api_key("llm.api_key", &config.llm.api_key_env);
    let tts_key = settings.api_key("tts.api_key", &config.tts.api_key_env);

    for (name, key) in [("stt", &stt_key), ("llm", &llm_key), ("tts", &tts_key)] {
        if key.is_empty() {
            tracing::warn!(provider = name, "no API key configured");
        }
    }

    Ok(ProviderSet {
        stt: Arc::new(WsSttClient::new(&config.stt, stt_key)),
        llm: Arc::new(OpenAiChatClient::new(&config.llm, llm_key)?),
        tts: Arc::new(HttpTtsClient::new(&config.tts, tts_key)?),
    })
}

/// Push runtime-adjustable settings into the live components.
pub fn apply_settings(
    settings: &SettingsStore,
    registry: &SessionRegistry,
    launcher: &SessionLauncher,
) {
    if let Some(max) = settings.max_concurrent_calls() {
        registry.set_max_concurrent(max);
        tracing::info!(max, "max_concurrent_calls applied");
    }
    if let Err(e) = launcher.rebuild_providers() {
        tracing::warn!(error = %e, "provider rebuild failed; keeping previous set");
    }
}
