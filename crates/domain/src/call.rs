//! Call entities: session state, transcript, prompt snapshot, lifecycle
//! events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Direction / state / outcome
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Inbound,
    Outbound,
}

/// Session FSM states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Pending,
    Greeting,
    Listening,
    Thinking,
    Speaking,
    HangingUp,
    Ended,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Pending => "pending",
            CallState::Greeting => "greeting",
            CallState::Listening => "listening",
            CallState::Thinking => "thinking",
            CallState::Speaking => "speaking",
            CallState::HangingUp => "hanging_up",
            CallState::Ended => "ended",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Ended)
    }

    /// States that count toward the live-session concurrency cap.
    pub fn is_live(&self) -> bool {
        !matches!(self, CallState::Ended)
    }
}

/// Terminal outcome of a call, recorded at finalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallOutcome {
    Completed,
    Failed,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Transcript
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptRole {
    Assistant,
    User,
}

/// One committed transcript entry. Interim STT hypotheses are never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: TranscriptRole,
    pub content: String,
    pub ts: DateTime<Utc>,
    /// Audio length behind this entry, when known (assistant entries: frames
    /// actually delivered to the switch; user entries: provider-reported).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_ms: Option<u64>,
}

impl TranscriptEntry {
    pub fn assistant(content: impl Into<String>, audio_ms: Option<u64>) -> Self {
        Self {
            role: TranscriptRole::Assistant,
            content: content.into(),
            ts: Utc::now(),
            audio_ms,
        }
    }

    pub fn user(content: impl Into<String>, audio_ms: Option<u64>) -> Self {
        Self {
            role: TranscriptRole::User,
            content: content.into(),
            ts: Utc::now(),
            audio_ms,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Prompt snapshot
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Immutable per-call copy of the prompt configuration, captured at
/// admission. Editing or re-activating the underlying prompt does not
/// alter an in-flight call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptSnapshot {
    pub system_text: String,
    pub voice_id: String,
    pub model: String,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub greeting: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Persisted call record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What initiated the call; campaign and schedule bindings are used by the
/// runners to route terminal events back to their rows.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum CallOrigin {
    #[default]
    Operator,
    Campaign {
        campaign_id: uuid::Uuid,
        contact_id: uuid::Uuid,
    },
    Schedule {
        schedule_id: uuid::Uuid,
    },
    Switch,
}

/// The persisted row for one call. In-memory sessions do not survive a
/// restart; rows still marked live on load are failed during recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub call_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub switch_uuid: Option<String>,
    pub caller: String,
    pub called: String,
    pub direction: CallDirection,
    #[serde(default)]
    pub origin: CallOrigin,
    pub prompt: PromptSnapshot,
    pub state: CallState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<CallOutcome>,
    pub created: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answered: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub transcript: Vec<TranscriptEntry>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Lifecycle events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Process-wide broadcast events emitted by sessions. Consumed by the
/// webhook dispatcher, the dashboard socket, and the campaign/schedule
/// runners.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LifecycleEvent {
    CallStarted {
        call_id: String,
        direction: CallDirection,
        caller: String,
        called: String,
        #[serde(skip)]
        origin: CallOrigin,
        timestamp: DateTime<Utc>,
    },
    CallStateChanged {
        call_id: String,
        from: CallState,
        to: CallState,
        timestamp: DateTime<Utc>,
    },
    CallEnded {
        call_id: String,
        outcome: CallOutcome,
        /// Whether the switch ever attached its media stream. `false`
        /// distinguishes connect/answer failures, which campaigns retry.
        answered: bool,
        duration_ms: u64,
        transcript: Vec<TranscriptEntry>,
        #[serde(skip)]
        origin: CallOrigin,
        timestamp: DateTime<Utc>,
    },
    CallFailed {
        call_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl LifecycleEvent {
    /// The webhook event name, e.g. `call.started`.
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::CallStarted { .. } => "call.started",
            LifecycleEvent::CallStateChanged { .. } => "call.state_changed",
            LifecycleEvent::CallEnded { .. } => "call.ended",
            LifecycleEvent::CallFailed { .. } => "call.failed",
        }
    }

    pub fn call_id(&self) -> &str {
        match self {
            LifecycleEvent::CallStarted { call_id, .. }
            | LifecycleEvent::CallStateChanged { call_id, .. }
            | LifecycleEvent::CallEnded { call_id, .. }
            | LifecycleEvent::CallFailed { call_id, .. } => call_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_serializes_snake_case() {
        let json = serde_json::to_string(&CallState::HangingUp).unwrap();
        assert_eq!(json, "\"hanging_up\"");
    }

    #[test]
    fn terminal_and_live_states() {
        assert!(CallState::Ended.is_terminal());
        assert!(!CallState::Speaking.is_terminal());
        assert!(CallState::Pending.is_live());
        assert!(!CallState::Ended.is_live());
    }

    #[test]
    fn event_names() {
        let ev = LifecycleEvent::CallFailed {
            call_id: "c1".into(),
            reason: "stt died".into(),
            timestamp: Utc::now(),
        };
        assert_eq!(ev.name(), "call.failed");
        assert_eq!(ev.call_id(), "c1");
    }

    #[test]
    fn transcript_entry_roles() {
        let e = TranscriptEntry::user("oi tudo bem", Some(2_000));
        assert_eq!(e.role, TranscriptRole::User);
        assert_eq!(e.audio_ms, Some(2_000));
    }

    #[test]
    fn call_origin_default_is_operator() {
        assert_eq!(CallOrigin::default(), CallOrigin::Operator);
    }
}
