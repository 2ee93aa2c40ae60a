//! In-memory committed transcript with the turn-alternation rules.
//!
//! Only finals are ever committed; interims stay in the FSM. Assistant
//! entries are committed exactly once per turn — at synthesis completion,
//! or truncated at barge-in.

use vox_domain::call::{TranscriptEntry, TranscriptRole};
use vox_domain::stream::{ChatMessage, ChatRole};

/// Rolling bound on in-memory entries; persisted rows are unaffected.
const MAX_ENTRIES: usize = 100;

#[derive(Default)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commit a user utterance. The FSM commits exactly one per turn, at
    /// utterance end; consecutive user entries can only occur when a
    /// barged-in assistant reply truncated to nothing.
    pub fn commit_user(&mut self, text: &str, audio_ms: Option<u64>) -> TranscriptEntry {
        let entry = TranscriptEntry::user(text, audio_ms);
        self.push(entry.clone());
        entry
    }

    /// Commit an assistant utterance (full or barge-in truncated).
    pub fn commit_assistant(&mut self, text: &str, audio_ms: Option<u64>) -> TranscriptEntry {
        let entry = TranscriptEntry::assistant(text, audio_ms);
        self.push(entry.clone());
        entry
    }

    fn push(&mut self, entry: TranscriptEntry) {
        self.entries.push(entry);
        if self.entries.len() > MAX_ENTRIES {
            let excess = self.entries.len() - MAX_ENTRIES;
            self.entries.drain(..excess);
        }
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn to_vec(&self) -> Vec<TranscriptEntry> {
        self.entries.clone()
    }

    /// Whether any user turn has been committed.
    pub fn has_user_turn(&self) -> bool {
        self.entries
            .iter()
            .any(|e| e.role == TranscriptRole::User)
    }

    /// Build the LLM input: system prompt plus the committed transcript.
    /// Interims and in-flight synthesis never appear here.
    pub fn chat_messages(&self, system_text: &str) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.entries.len() + 1);
        messages.push(ChatMessage::system(system_text));
        for entry in &self.entries {
            let role = match entry.role {
                TranscriptRole::User => ChatRole::User,
                TranscriptRole::Assistant => ChatRole::Assistant,
            };
            messages.push(ChatMessage {
                role,
                content: entry.content.clone(),
            });
        }
        messages
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Barge-in truncation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Estimate the text actually delivered to the caller from the audio that
/// reached the switch, cutting back to a word boundary.
pub fn truncate_spoken(text: &str, delivered_ms: u64, chars_per_sec: f64) -> String {
    let budget = ((delivered_ms as f64 / 1000.0) * chars_per_sec).floor() as usize;
    let total = text.chars().count();
    if budget >= total {
        return text.to_string();
    }
    if budget == 0 {
        return String::new();
    }

    let cut: String = text.chars().take(budget).collect();
    // Back off to the last whole word, unless that erases everything.
    match cut.rfind(char::is_whitespace) {
        Some(idx) if idx > 0 => cut[..idx].trim_end().to_string(),
        _ => cut.trim_end().to_string(),
    }
}
