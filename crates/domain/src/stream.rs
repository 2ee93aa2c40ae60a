//! Provider streaming event types, shared by the adapter crates and the
//! session FSM.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// A boxed async stream, used for provider byte/event streams.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// STT
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Events emitted by a live speech-to-text stream, in provider order.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SttEvent {
    /// Partial hypothesis, subject to revision. Used for barge-in detection
    /// only; never persisted.
    Interim { text: String, ts: DateTime<Utc> },
    /// Locked-in transcript for an utterance segment.
    Final {
        text: String,
        ts: DateTime<Utc>,
        duration_ms: u64,
    },
    /// The provider (or the client's quiet timer) decided the utterance is
    /// over.
    UtteranceEnd,
    Error { message: String },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Events emitted by a streaming chat completion.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LlmEvent {
    Delta { text: String },
    Done { full_text: String },
    Error { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: content.into() }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: content.into() }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: content.into() }
    }
}

/// A chat completion request: system prompt first, then alternating
/// user/assistant turns, the most recent message being user.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TTS
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Events emitted by a streaming synthesis: fixed 320-byte PCM frames and a
/// terminal `Done`.
#[derive(Debug, Clone)]
pub enum TtsEvent {
    Frame { pcm: Vec<u8> },
    Done,
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_roles_serialize_lowercase() {
        assert_eq!(ChatRole::Assistant.as_str(), "assistant");
        let json = serde_json::to_string(&ChatRole::System).unwrap();
        assert_eq!(json, "\"system\"");
    }

    #[test]
    fn stt_event_tagging() {
        let ev = SttEvent::UtteranceEnd;
        let json = serde_json::to_string(&ev).unwrap();
        assert_eq!(json, r#"{"type":"utterance_end"}"#);
    }
}
