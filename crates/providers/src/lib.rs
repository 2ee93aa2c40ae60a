//! Streaming provider adapters: speech-to-text, chat completion, and
//! speech synthesis.
//!
//! Each adapter hides its wire dialect behind a narrow trait returning a
//! channel-backed stream handle with an idempotent cancellation token, so
//! the session FSM can fan all provider events into one `select!` loop.

pub mod llm;
pub mod stt;
pub mod traits;
pub mod tts;
pub mod util;

pub use traits::{LlmProvider, LlmStream, SttProvider, SttSession, TtsProvider, TtsStream};
