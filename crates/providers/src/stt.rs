//! Realtime speech-to-text over a provider WebSocket (Deepgram-style wire
//! contract: linear16 frames in, JSON result events out).
//!
//! One connection serves the whole call; utterances are delimited by the
//! provider's endpointing. For providers that never emit an explicit
//! utterance-end, the client synthesizes one after a configurable quiet
//! period following the most recent final.

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use vox_domain::config::SttConfig;
use vox_domain::error::{Error, Result};
use vox_domain::stream::SttEvent;

use crate::traits::{SttProvider, SttSession};

/// One second of queued frames; beyond that the provider is behind
/// realtime and the FSM drops frames.
const AUDIO_BUFFER_FRAMES: usize = 50;
const EVENT_BUFFER: usize = 64;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct WsSttClient {
    base_url: String,
    api_key: String,
    model: String,
    language: String,
    utterance_end_ms: u64,
}

impl WsSttClient {
    pub fn new(cfg: &SttConfig, api_key: String) -> Self {
        Self {
            base_url: cfg.base_url.clone(),
            api_key,
            model: cfg.model.clone(),
            language: cfg.language.clone(),
            utterance_end_ms: cfg.utterance_end_ms,
        }
    }

    fn stream_url(&self) -> String {
        format!(
            "{}?model={}&language={}&encoding=linear16&sample_rate=8000&channels=1\
             &interim_results=true&vad_events=true",
            self.base_url, self.model, self.language
        )
    }
}

#[async_trait::async_trait]
impl SttProvider for WsSttClient {
    async fn open(&self) -> Result<SttSession> {
        let url = self.stream_url();
        let mut request = url
            .into_client_request()
            .map_err(|e| Error::Provider {
                provider: "stt".into(),
                message: format!("bad stream url: {e}"),
            })?;
        let auth = format!("Token {}", self.api_key)
            .parse()
            .map_err(|_| Error::Provider {
                provider: "stt".into(),
                message: "API key is not a valid header value".into(),
            })?;
        request.headers_mut().insert("Authorization", auth);

        let (ws, _response) =
            tokio_tungstenite::connect_async(request)
                .await
                .map_err(|e| Error::Provider {
                    provider: "stt".into(),
                    message: format!("connect: {e}"),
                })?;
        let (sink, stream) = ws.split();

        let (audio_tx, audio_rx) = mpsc::channel::<Vec<u8>>(AUDIO_BUFFER_FRAMES);
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let cancel = CancellationToken::new();

        tokio::spawn(pump_audio(sink, audio_rx, cancel.clone()));
        tokio::spawn(pump_events(
            stream,
            events_tx,
            cancel.clone(),
            self.utterance_end_ms,
        ));

        tracing::debug!(model = %self.model, language = %self.language, "stt stream open");

        Ok(SttSession {
            audio: audio_tx,
            events: events_rx,
            cancel,
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pump tasks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn pump_audio(
    mut sink: impl SinkExt<Message> + Unpin,
    mut audio_rx: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => None,
            f = audio_rx.recv() => f,
        };
        match frame {
            Some(pcm) => {
                if sink.send(Message::Binary(pcm)).await.is_err() {
                    break;
                }
            }
            None => {
                // Caller closed the audio channel (or cancelled): tell the
                // provider the stream is over, then drop the sink.
                let _ = sink
                    .send(Message::Text(r#"{"type":"CloseStream"}"#.into()))
                    .await;
                break;
            }
        }
    }
}

async fn pump_events(
    mut stream: impl StreamExt<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
    events: mpsc::Sender<SttEvent>,
    cancel: CancellationToken,
    utterance_end_ms: u64,
) {
    // Armed after each final; fires a synthesized utterance-end when the
    // provider goes quiet without emitting its own.
    let mut quiet_deadline: Option<tokio::time::Instant> = None;

    loop {
        let quiet = async {
            match quiet_deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = quiet => {
                quiet_deadline = None;
                if events.send(SttEvent::UtteranceEnd).await.is_err() {
                    break;
                }
            }
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Some(event) = parse_stt_message(&text) {
                        quiet_deadline = match &event {
                            SttEvent::Final { .. } => Some(
                                tokio::time::Instant::now()
                                    + std::time::Duration::from_millis(utterance_end_ms),
                            ),
                            // Provider endpointed on its own, or the user is
                            // still talking.
                            _ => None,
                        };
                        if events.send(event).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = events
                        .send(SttEvent::Error { message: e.to_string() })
                        .await;
                    break;
                }
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Map a provider result message to a session event. Empty transcripts
/// (silence) produce nothing.
fn parse_stt_message(text: &str) -> Option<SttEvent> {
    let v: Value = serde_json::from_str(text).ok()?;
    match v.get("type").and_then(|t| t.as_str())? {
        "Results" => {
            let transcript = v
                .get("channel")?
                .get("alternatives")?
                .as_array()?
                .first()?
                .get("transcript")?
                .as_str()?
                .trim();
            if transcript.is_empty() {
                return None;
            }
            let is_final = v.get("is_final").and_then(|b| b.as_bool()).unwrap_or(false);
            if is_final {
                let duration_ms = v
                    .get("duration")
                    .and_then(|d| d.as_f64())
                    .map(|secs| (secs * 1000.0) as u64)
                    .unwrap_or(0);
                Some(SttEvent::Final {
                    text: transcript.to_string(),
                    ts: Utc::now(),
                    duration_ms,
                })
            } else {
                Some(SttEvent::Interim {
                    text: transcript.to_string(),
                    ts: Utc::now(),
                })
            }
        }
        "UtteranceEnd" => Some(SttEvent::UtteranceEnd),
        "Error" => Some(SttEvent::Error {
            message: v
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown provider error")
                .to_string(),
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_interim_result() {
        let text = r#"{"type":"Results","is_final":false,
            "channel":{"alternatives":[{"transcript":"oi tu"}]}}"#;
        match parse_stt_message(text) {
            Some(SttEvent::Interim { text, .. }) => assert_eq!(text, "oi tu"),
            other => panic!("expected interim, got {other:?}"),
        }
    }

    #[test]
    fn parse_final_result_with_duration() {
        let text = r#"{"type":"Results","is_final":true,"duration":1.98,
            "channel":{"alternatives":[{"transcript":"oi tudo bem"}]}}"#;
        match parse_stt_message(text) {
            Some(SttEvent::Final {
                text, duration_ms, ..
            }) => {
                assert_eq!(text, "oi tudo bem");
                assert_eq!(duration_ms, 1_980);
            }
            other => panic!("expected final, got {other:?}"),
        }
    }

    #[test]
    fn silence_produces_no_event() {
        let text = r#"{"type":"Results","is_final":false,
            "channel":{"alternatives":[{"transcript":"  "}]}}"#;
        assert!(parse_stt_message(text).is_none());
    }

    #[test]
    fn parse_utterance_end() {
        let text = r#"{"type":"UtteranceEnd","last_word_end":2.1}"#;
        assert!(matches!(
            parse_stt_message(text),
            Some(SttEvent::UtteranceEnd)
        ));
    }

    #[test]
    fn parse_provider_error() {
        let text = r#"{"type":"Error","message":"bad model"}"#;
        match parse_stt_message(text) {
            Some(SttEvent::Error { message }) => assert_eq!(message, "bad model"),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn unknown_message_type_is_ignored() {
        assert!(parse_stt_message(r#"{"type":"Metadata"}"#).is_none());
        assert!(parse_stt_message("not json").is_none());
    }
}
