//! Prompt entity: system text, voice, model, and optional greeting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::call::PromptSnapshot;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prompt {
    pub id: Uuid,
    pub name: String,
    pub system_text: String,
    pub voice_id: String,
    pub model: String,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub greeting: Option<String>,
    /// Measured length of the synthesized greeting, cached after the first
    /// pre-synthesis so the dashboard can show it without another synth.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub greeting_duration_ms: Option<u64>,
    /// Exactly one prompt is active at a time; activation is an atomic swap
    /// in the store.
    #[serde(default)]
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Prompt {
    pub fn snapshot(&self) -> PromptSnapshot {
        PromptSnapshot {
            system_text: self.system_text.clone(),
            voice_id: self.voice_id.clone(),
            model: self.model.clone(),
            temperature: self.temperature,
            greeting: self.greeting.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_copies_fields() {
        let p = Prompt {
            id: Uuid::new_v4(),
            name: "support".into(),
            system_text: "You are a helpful phone assistant.".into(),
            voice_id: "luna".into(),
            model: "gpt-4o-mini".into(),
            temperature: 0.6,
            greeting: Some("Olá, em que posso ajudar?".into()),
            greeting_duration_ms: None,
            active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let s = p.snapshot();
        assert_eq!(s.voice_id, "luna");
        assert_eq!(s.greeting.as_deref(), Some("Olá, em que posso ajudar?"));
    }
}
