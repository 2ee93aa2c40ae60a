use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use vox_domain::error::Result;
use vox_domain::stream::{ChatRequest, LlmEvent, SttEvent, TtsEvent};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// STT
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A speech-to-text adapter. One open stream serves an entire call; the
/// provider's endpointing drives utterance boundaries.
#[async_trait::async_trait]
pub trait SttProvider: Send + Sync {
    /// Open a continuous recognition stream for linear16 8 kHz mono audio.
    async fn open(&self) -> Result<SttSession>;
}

/// A live recognition stream.
///
/// Audio frames go in through `audio`; ordered events come out of `events`.
/// Dropping the session or calling `close()` cancels the underlying
/// connection; both are idempotent.
pub struct SttSession {
    /// PCM frames to the provider. `try_send` from the FSM loop; a full
    /// queue means the provider is behind realtime and frames are dropped.
    pub audio: mpsc::Sender<Vec<u8>>,
    pub events: mpsc::Receiver<SttEvent>,
    pub cancel: CancellationToken,
}

impl SttSession {
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for SttSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A streaming chat-completion adapter.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Start a completion stream. Returns once the request is accepted.
    async fn stream(&self, req: ChatRequest) -> Result<LlmStream>;
}

/// An in-flight completion. `cancel()` aborts the upstream request at the
/// next token boundary, which also stops provider-side billing.
pub struct LlmStream {
    pub events: mpsc::Receiver<LlmEvent>,
    pub cancel: CancellationToken,
}

impl LlmStream {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for LlmStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TTS
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A streaming synthesis adapter producing fixed 20 ms switch frames.
#[async_trait::async_trait]
pub trait TtsProvider: Send + Sync {
    /// Start one synthesized utterance with the given voice.
    async fn synthesize(&self, voice_id: &str) -> Result<TtsStream>;
}

/// One utterance being synthesized.
///
/// Text is fed incrementally through `text`; closing the sender marks the
/// utterance complete and the stream emits its terminal `Done` after the
/// last frame. `cancel()` stops frame emission within one frame and drains
/// the provider; it is idempotent.
pub struct TtsStream {
    pub text: mpsc::Sender<String>,
    pub events: mpsc::Receiver<TtsEvent>,
    pub cancel: CancellationToken,
}

impl TtsStream {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}
