use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Call engine tunables
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Global cap on concurrently live sessions. Overridable at runtime via
    /// the settings key `max_concurrent_calls`.
    #[serde(default = "d_max_calls")]
    pub max_concurrent_calls: usize,
    /// Interim characters that trigger barge-in while the assistant speaks.
    #[serde(default = "d_barge_chars")]
    pub barge_in_min_chars: usize,
    /// Seconds the switch has to attach media after an origination.
    #[serde(default = "d_connect_secs")]
    pub connect_timeout_secs: u64,
    /// Seconds without audio in either direction before the polite hangup.
    #[serde(default = "d_inactivity_secs")]
    pub inactivity_timeout_secs: u64,
    /// Seconds to wait for the first LLM token before apologizing.
    #[serde(default = "d_llm_first_secs")]
    pub llm_first_token_secs: u64,
    /// Seconds before a missing first TTS frame is logged as a warning.
    #[serde(default = "d_tts_warn_secs")]
    pub tts_first_frame_warn_secs: u64,
    /// Seconds before a missing first TTS frame fails the utterance.
    #[serde(default = "d_tts_fail_secs")]
    pub tts_first_frame_fail_secs: u64,
    /// Bound on provider drain during session teardown.
    #[serde(default = "d_drain_secs")]
    pub teardown_drain_secs: u64,
    /// Spoken when the model takes too long or returns nothing.
    #[serde(default = "d_apology")]
    pub apology_phrase: String,
    /// Spoken before an inactivity hangup.
    #[serde(default = "d_farewell")]
    pub farewell_phrase: String,
    /// Estimated speech rate used to truncate a barged-in assistant entry
    /// to the text actually delivered.
    #[serde(default = "d_chars_per_sec")]
    pub speech_chars_per_sec: f64,
    /// Replies past this length stop the model and finish the turn with
    /// what was already synthesized.
    #[serde(default = "d_max_reply_chars")]
    pub max_reply_chars: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: d_max_calls(),
            barge_in_min_chars: d_barge_chars(),
            connect_timeout_secs: d_connect_secs(),
            inactivity_timeout_secs: d_inactivity_secs(),
            llm_first_token_secs: d_llm_first_secs(),
            tts_first_frame_warn_secs: d_tts_warn_secs(),
            tts_first_frame_fail_secs: d_tts_fail_secs(),
            teardown_drain_secs: d_drain_secs(),
            apology_phrase: d_apology(),
            farewell_phrase: d_farewell(),
            speech_chars_per_sec: d_chars_per_sec(),
            max_reply_chars: d_max_reply_chars(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_max_calls() -> usize {
    20
}
fn d_barge_chars() -> usize {
    3
}
fn d_connect_secs() -> u64 {
    45
}
fn d_inactivity_secs() -> u64 {
    30
}
fn d_llm_first_secs() -> u64 {
    8
}
fn d_tts_warn_secs() -> u64 {
    4
}
fn d_tts_fail_secs() -> u64 {
    10
}
fn d_drain_secs() -> u64 {
    2
}
fn d_apology() -> String {
    "Desculpe, tive um problema para responder. Pode repetir?".into()
}
fn d_farewell() -> String {
    "Parece que a ligação ficou em silêncio. Até logo!".into()
}
fn d_chars_per_sec() -> f64 {
    15.0
}
fn d_max_reply_chars() -> usize {
    1_000
}
