use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// STT
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttConfig {
    /// WebSocket endpoint of the realtime STT provider.
    #[serde(default = "d_stt_url")]
    pub base_url: String,
    /// Environment variable holding the STT API key. Overridable at runtime
    /// through the settings store (`stt.api_key`).
    #[serde(default = "d_stt_key_env")]
    pub api_key_env: String,
    #[serde(default = "d_stt_model")]
    pub model: String,
    #[serde(default = "d_lang")]
    pub language: String,
    /// Quiet time after a final before the client synthesizes an
    /// utterance-end, for providers that do not emit one.
    #[serde(default = "d_utterance_end_ms")]
    pub utterance_end_ms: u64,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            base_url: d_stt_url(),
            api_key_env: d_stt_key_env(),
            model: d_stt_model(),
            language: d_lang(),
            utterance_end_ms: d_utterance_end_ms(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Base URL of an OpenAI-compatible chat completions endpoint.
    #[serde(default = "d_llm_url")]
    pub base_url: String,
    #[serde(default = "d_llm_key_env")]
    pub api_key_env: String,
    /// Default model when the prompt does not name one.
    #[serde(default = "d_llm_model")]
    pub default_model: String,
    #[serde(default = "d_temperature")]
    pub default_temperature: f32,
    #[serde(default = "d_max_tokens")]
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: d_llm_url(),
            api_key_env: d_llm_key_env(),
            default_model: d_llm_model(),
            default_temperature: d_temperature(),
            max_tokens: d_max_tokens(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TTS
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    /// HTTP endpoint of the streaming synthesis provider.
    #[serde(default = "d_tts_url")]
    pub base_url: String,
    #[serde(default = "d_tts_key_env")]
    pub api_key_env: String,
    #[serde(default = "d_voice")]
    pub default_voice_id: String,
    /// Sentence batch cap: text is flushed to the provider at sentence
    /// boundaries or once this many characters accumulate.
    #[serde(default = "d_batch_chars")]
    pub max_batch_chars: usize,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            base_url: d_tts_url(),
            api_key_env: d_tts_key_env(),
            default_voice_id: d_voice(),
            max_batch_chars: d_batch_chars(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_stt_url() -> String {
    "wss://api.deepgram.com/v1/listen".into()
}
fn d_stt_key_env() -> String {
    "VOX_STT_API_KEY".into()
}
fn d_stt_model() -> String {
    "nova-2".into()
}
fn d_lang() -> String {
    "pt-BR".into()
}
fn d_utterance_end_ms() -> u64 {
    700
}
fn d_llm_url() -> String {
    "https://api.openai.com/v1".into()
}
fn d_llm_key_env() -> String {
    "VOX_LLM_API_KEY".into()
}
fn d_llm_model() -> String {
    "gpt-4o-mini".into()
}
fn d_temperature() -> f32 {
    0.7
}
fn d_max_tokens() -> u32 {
    512
}
fn d_tts_url() -> String {
    "https://api.deepgram.com/v1/speak".into()
}
fn d_tts_key_env() -> String {
    "VOX_TTS_API_KEY".into()
}
fn d_voice() -> String {
    "aura-luna-pt".into()
}
fn d_batch_chars() -> usize {
    120
}
