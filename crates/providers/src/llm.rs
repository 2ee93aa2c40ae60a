//! OpenAI-compatible streaming chat adapter.
//!
//! Works with OpenAI, Azure-compatible gateways, Ollama, vLLM, and any
//! other endpoint following the chat completions SSE contract. The stream
//! is pumped into a channel by a background task so the session FSM can
//! select on it; cancelling the stream aborts the HTTP request, which
//! stops upstream token generation promptly.

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use vox_domain::config::LlmConfig;
use vox_domain::error::{Error, Result};
use vox_domain::stream::{ChatRequest, LlmEvent};

use crate::traits::{LlmProvider, LlmStream};
use crate::util::from_reqwest;

const EVENT_BUFFER: usize = 64;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct OpenAiChatClient {
    base_url: String,
    api_key: String,
    max_tokens: u32,
    client: reqwest::Client,
}

impl OpenAiChatClient {
    pub fn new(cfg: &LlmConfig, api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(from_reqwest)?;
        Ok(Self {
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key,
            max_tokens: cfg.max_tokens,
            client,
        })
    }

    fn build_body(&self, req: &ChatRequest) -> Value {
        let messages: Vec<Value> = req
            .messages
            .iter()
            .map(|m| serde_json::json!({ "role": m.role.as_str(), "content": m.content }))
            .collect();

        serde_json::json!({
            "model": req.model,
            "messages": messages,
            "temperature": req.temperature,
            "max_tokens": req.max_tokens.unwrap_or(self.max_tokens),
            "stream": true,
        })
    }
}

#[async_trait::async_trait]
impl LlmProvider for OpenAiChatClient {
    async fn stream(&self, req: ChatRequest) -> Result<LlmStream> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_body(&req);

        tracing::debug!(url = %url, model = %req.model, "chat stream request");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let err_text = resp.text().await.unwrap_or_default();
            return Err(Error::Provider {
                provider: "llm".into(),
                message: format!("HTTP {} - {}", status.as_u16(), err_text),
            });
        }

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        tokio::spawn(pump_completion(resp, events_tx, token));

        Ok(LlmStream {
            events: events_rx,
            cancel,
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stream pump
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn pump_completion(
    mut resp: reqwest::Response,
    events: mpsc::Sender<LlmEvent>,
    cancel: CancellationToken,
) {
    let mut sse = SseBuffer::new();
    let mut full_text = String::new();
    let mut finished = false;

    'read: loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => break,
            c = resp.chunk() => c,
        };

        match chunk {
            Ok(Some(bytes)) => {
                for data in sse.feed(&bytes) {
                    match parse_sse_data(&data) {
                        Some(CompletionChunk::Delta(text)) => {
                            full_text.push_str(&text);
                            if events.send(LlmEvent::Delta { text }).await.is_err() {
                                break 'read;
                            }
                        }
                        Some(CompletionChunk::Done) => {
                            finished = true;
                            break 'read;
                        }
                        None => {}
                    }
                }
            }
            Ok(None) => {
                // Body closed; a last event may sit unterminated in the
                // buffer.
                for data in sse.finish() {
                    if let Some(CompletionChunk::Delta(text)) = parse_sse_data(&data) {
                        full_text.push_str(&text);
                        if events.send(LlmEvent::Delta { text }).await.is_err() {
                            break;
                        }
                    }
                }
                finished = true;
                break;
            }
            Err(e) => {
                let _ = events
                    .send(LlmEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                return;
            }
        }
    }

    if finished {
        let _ = events.send(LlmEvent::Done { full_text }).await;
    }
    // Dropping `resp` here releases the connection; on cancellation the
    // provider sees the abort at the next token boundary.
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SSE buffering
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Accumulates raw response bytes and yields complete `data:` payloads.
///
/// An SSE event ends at a blank line; `event:`/`id:`/`retry:` fields and
/// comment lines are dropped, only `data:` matters for the completions
/// contract.
struct SseBuffer {
    pending: String,
}

impl SseBuffer {
    fn new() -> Self {
        Self {
            pending: String::new(),
        }
    }

    /// Feed a network chunk; returns every payload it completed.
    fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.push_str(&String::from_utf8_lossy(chunk));
        let mut payloads = Vec::new();
        while let Some(end) = self.pending.find("\n\n") {
            let event: String = self.pending.drain(..end + 2).collect();
            payloads.extend(payloads_of(&event));
        }
        payloads
    }

    /// Flush whatever unterminated event remains at end of stream.
    fn finish(&mut self) -> Vec<String> {
        let rest = std::mem::take(&mut self.pending);
        payloads_of(&rest)
    }
}

fn payloads_of(event: &str) -> Vec<String> {
    event
        .lines()
        .filter_map(|line| line.trim_start().strip_prefix("data:"))
        .map(str::trim)
        .filter(|data| !data.is_empty())
        .map(str::to_owned)
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Payload parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum CompletionChunk {
    Delta(String),
    Done,
}

fn parse_sse_data(data: &str) -> Option<CompletionChunk> {
    if data.trim() == "[DONE]" {
        return Some(CompletionChunk::Done);
    }

    let v: Value = serde_json::from_str(data).ok()?;
    let choice = v.get("choices")?.as_array()?.first()?;

    if choice
        .get("finish_reason")
        .and_then(|f| f.as_str())
        .is_some()
    {
        return Some(CompletionChunk::Done);
    }

    let text = choice.get("delta")?.get("content")?.as_str()?;
    if text.is_empty() {
        return None;
    }
    Some(CompletionChunk::Delta(text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_yields_completed_payload() {
        let mut sse = SseBuffer::new();
        let out = sse.feed(b"event: message\ndata: {\"delta\":\"oi\"}\n\n");
        assert_eq!(out, vec!["{\"delta\":\"oi\"}"]);
    }

    #[test]
    fn feed_holds_partial_event_until_terminated() {
        let mut sse = SseBuffer::new();
        assert!(sse.feed(b"data: half").is_empty());
        let out = sse.feed(b"-done\n\ndata: next\n\n");
        assert_eq!(out, vec!["half-done", "next"]);
    }

    #[test]
    fn feed_splits_multi_event_chunk() {
        let mut sse = SseBuffer::new();
        let out = sse.feed(b"data: a\n\ndata: b\n\ndata: c");
        assert_eq!(out, vec!["a", "b"]);
        assert_eq!(sse.finish(), vec!["c"]);
    }

    #[test]
    fn non_data_fields_are_dropped() {
        let mut sse = SseBuffer::new();
        let out = sse.feed(b"event: ping\nid: 42\nretry: 5000\ndata: payload\n\n");
        assert_eq!(out, vec!["payload"]);
    }

    #[test]
    fn blank_data_lines_are_dropped() {
        let mut sse = SseBuffer::new();
        assert!(sse.feed(b"data: \n\n").is_empty());
        assert!(sse.finish().is_empty());
    }

    #[test]
    fn finish_is_idempotent() {
        let mut sse = SseBuffer::new();
        sse.feed(b"data: tail");
        assert_eq!(sse.finish(), vec!["tail"]);
        assert!(sse.finish().is_empty());
    }

    #[test]
    fn parse_delta_chunk() {
        let data = r#"{"choices":[{"delta":{"content":"Olá"},"index":0}]}"#;
        match parse_sse_data(data) {
            Some(CompletionChunk::Delta(t)) => assert_eq!(t, "Olá"),
            _ => panic!("expected delta"),
        }
    }

    #[test]
    fn parse_done_sentinel() {
        assert!(matches!(
            parse_sse_data("[DONE]"),
            Some(CompletionChunk::Done)
        ));
    }

    #[test]
    fn parse_finish_reason_ends_stream() {
        let data = r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#;
        assert!(matches!(
            parse_sse_data(data),
            Some(CompletionChunk::Done)
        ));
    }

    #[test]
    fn parse_empty_delta_is_skipped() {
        let data = r#"{"choices":[{"delta":{"content":""}}]}"#;
        assert!(parse_sse_data(data).is_none());
    }

    #[test]
    fn parse_role_only_delta_is_skipped() {
        let data = r#"{"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert!(parse_sse_data(data).is_none());
    }

    #[test]
    fn parse_garbage_is_skipped() {
        assert!(parse_sse_data("not json").is_none());
    }
}
