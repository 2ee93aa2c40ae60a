//! Streaming speech synthesis over a provider HTTP endpoint.
//!
//! The provider synthesizes whole text batches; this adapter accepts text
//! incrementally, batches it at sentence boundaries (or a character cap),
//! streams the returned PCM, and re-chunks it into exact 20 ms switch
//! frames. Cancellation stops frame emission within one frame and aborts
//! the in-flight provider request.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use vox_domain::audio::FrameSplitter;
use vox_domain::config::TtsConfig;
use vox_domain::error::Result;
use vox_domain::stream::TtsEvent;

use crate::traits::{TtsProvider, TtsStream};
use crate::util::from_reqwest;

const TEXT_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 32;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct HttpTtsClient {
    base_url: String,
    api_key: String,
    max_batch_chars: usize,
    client: reqwest::Client,
}

impl HttpTtsClient {
    pub fn new(cfg: &TtsConfig, api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(from_reqwest)?;
        Ok(Self {
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key,
            max_batch_chars: cfg.max_batch_chars,
            client,
        })
    }
}

#[async_trait::async_trait]
impl TtsProvider for HttpTtsClient {
    async fn synthesize(&self, voice_id: &str) -> Result<TtsStream> {
        let (text_tx, text_rx) = mpsc::channel(TEXT_BUFFER);
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let cancel = CancellationToken::new();

        let url = format!(
            "{}?voice={}&encoding=linear16&sample_rate=8000&container=none",
            self.base_url, voice_id
        );

        tokio::spawn(run_synthesis(
            self.client.clone(),
            url,
            self.api_key.clone(),
            self.max_batch_chars,
            text_rx,
            events_tx,
            cancel.clone(),
        ));

        Ok(TtsStream {
            text: text_tx,
            events: events_rx,
            cancel,
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Synthesis task
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn run_synthesis(
    client: reqwest::Client,
    url: String,
    api_key: String,
    max_batch_chars: usize,
    mut text_rx: mpsc::Receiver<String>,
    events: mpsc::Sender<TtsEvent>,
    cancel: CancellationToken,
) {
    let mut batcher = SentenceBatcher::new(max_batch_chars);

    loop {
        let text = tokio::select! {
            _ = cancel.cancelled() => return,
            t = text_rx.recv() => t,
        };

        match text {
            Some(t) => {
                for batch in batcher.push(&t) {
                    if !speak_batch(&client, &url, &api_key, &batch, &events, &cancel).await {
                        return;
                    }
                }
            }
            None => {
                // Text input closed: flush the trailing partial sentence,
                // then finish the utterance.
                if let Some(rest) = batcher.flush() {
                    if !speak_batch(&client, &url, &api_key, &rest, &events, &cancel).await {
                        return;
                    }
                }
                let _ = events.send(TtsEvent::Done).await;
                return;
            }
        }
    }
}

/// Synthesize one batch and emit its frames. Returns `false` when the
/// utterance should stop (cancelled, error, or receiver gone).
async fn speak_batch(
    client: &reqwest::Client,
    url: &str,
    api_key: &str,
    text: &str,
    events: &mpsc::Sender<TtsEvent>,
    cancel: &CancellationToken,
) -> bool {
    let resp = tokio::select! {
        _ = cancel.cancelled() => return false,
        r = client
            .post(url)
            .header("Authorization", format!("Token {api_key}"))
            .header("Content-Type", "application/json")
            .json(&serde_json::json!({ "text": text }))
            .send() => r,
    };

    let mut resp = match resp {
        Ok(r) if r.status().is_success() => r,
        Ok(r) => {
            let _ = events
                .send(TtsEvent::Error {
                    message: format!("HTTP {}", r.status().as_u16()),
                })
                .await;
            return false;
        }
        Err(e) => {
            let _ = events
                .send(TtsEvent::Error {
                    message: e.to_string(),
                })
                .await;
            return false;
        }
    };

    let mut splitter = FrameSplitter::new();
    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return false,
            c = resp.chunk() => c,
        };
        match chunk {
            Ok(Some(bytes)) => {
                for pcm in splitter.push(&bytes) {
                    if cancel.is_cancelled() {
                        return false;
                    }
                    if events.send(TtsEvent::Frame { pcm }).await.is_err() {
                        return false;
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                let _ = events
                    .send(TtsEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                return false;
            }
        }
    }

    if let Some(pcm) = splitter.flush() {
        if events.send(TtsEvent::Frame { pcm }).await.is_err() {
            return false;
        }
    }
    true
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sentence batching
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Accumulates incremental text and cuts provider batches at sentence
/// boundaries (`.`, `?`, `!`) or once `max_chars` characters pile up
/// without one (cut at the last whitespace when possible).
pub struct SentenceBatcher {
    buf: String,
    max_chars: usize,
}

impl SentenceBatcher {
    pub fn new(max_chars: usize) -> Self {
        Self {
            buf: String::new(),
            max_chars: max_chars.max(1),
        }
    }

    /// Feed a text fragment; returns all batches now ready to synthesize.
    pub fn push(&mut self, text: &str) -> Vec<String> {
        self.buf.push_str(text);
        let mut out = Vec::new();

        loop {
            if let Some(end) = self
                .buf
                .char_indices()
                .find(|(_, c)| matches!(c, '.' | '?' | '!'))
                .map(|(i, c)| i + c.len_utf8())
            {
                let batch: String = self.buf.drain(..end).collect();
                let batch = batch.trim();
                if !batch.is_empty() {
                    out.push(batch.to_string());
                }
                continue;
            }

            if self.buf.chars().count() >= self.max_chars {
                let cut = self.overflow_cut();
                let batch: String = self.buf.drain(..cut).collect();
                let batch = batch.trim();
                if !batch.is_empty() {
                    out.push(batch.to_string());
                }
                continue;
            }

            break;
        }
        out
    }

    /// Flush whatever text remains, if any.
    pub fn flush(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        let rest = rest.trim();
        if rest.is_empty() {
            None
        } else {
            Some(rest.to_string())
        }
    }

    /// Byte index to cut an over-long batch at: the last whitespace within
    /// the window, or a hard cut at `max_chars` characters.
    fn overflow_cut(&self) -> usize {
        let window_end = self
            .buf
            .char_indices()
            .nth(self.max_chars)
            .map(|(i, _)| i)
            .unwrap_or(self.buf.len());
        self.buf[..window_end]
            .char_indices()
            .filter(|(_, c)| c.is_whitespace())
            .map(|(i, _)| i)
            .next_back()
            .filter(|&i| i > 0)
            .unwrap_or(window_end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batches_on_sentence_boundary() {
        let mut b = SentenceBatcher::new(120);
        assert!(b.push("Olá, em que").is_empty());
        let out = b.push(" posso ajudar? Posso ver");
        assert_eq!(out, vec!["Olá, em que posso ajudar?"]);
        assert_eq!(b.flush().as_deref(), Some("Posso ver"));
    }

    #[test]
    fn multiple_sentences_in_one_push() {
        let mut b = SentenceBatcher::new(120);
        let out = b.push("Sim. Claro! Pode falar.");
        assert_eq!(out, vec!["Sim.", "Claro!", "Pode falar."]);
        assert!(b.flush().is_none());
    }

    #[test]
    fn overflow_cuts_at_whitespace() {
        let mut b = SentenceBatcher::new(10);
        let out = b.push("palavra um dois tres");
        assert!(!out.is_empty());
        for batch in &out {
            assert!(batch.chars().count() <= 10, "batch too long: {batch:?}");
        }
    }

    #[test]
    fn overflow_without_whitespace_hard_cuts() {
        let mut b = SentenceBatcher::new(5);
        let out = b.push("abcdefghij");
        assert_eq!(out, vec!["abcde", "fghij"]);
    }

    #[test]
    fn flush_on_empty_is_none() {
        let mut b = SentenceBatcher::new(120);
        assert!(b.flush().is_none());
        b.push("   ");
        assert!(b.flush().is_none());
    }

    #[test]
    fn multibyte_text_is_not_split_mid_char() {
        let mut b = SentenceBatcher::new(4);
        let out = b.push("çãéíõ");
        for batch in out {
            assert!(batch.chars().count() <= 4);
        }
    }
}
