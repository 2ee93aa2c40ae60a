//! Switch media adapter: the `/ws/:call_id` endpoint.
//!
//! Binary frames are raw linear PCM 8 kHz mono, 320 bytes per 20 ms.
//! Text frames are JSON control (`metadata`, `dtmf`, `hangup`). Outgoing
//! audio is paced at wall-clock 20 ms from the session's outbox.
//!
//! A socket with no matching session waits out a grace window for either
//! the session to appear (origination race) or an inbound `metadata`
//! frame that creates one; otherwise it is closed with a policy-violation
//! code and no session is created.

use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use vox_domain::audio::{FRAME_BYTES, FRAME_MS};
use vox_sessions::{FramePoll, SessionCommand, SwitchInbound, SwitchLink};

use crate::state::AppState;

const INBOUND_BUFFER: usize = 64;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Control frames
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ControlFrame {
    Metadata {
        caller: Option<String>,
        called: Option<String>,
        switch_uuid: Option<String>,
    },
    Dtmf {
        digit: String,
    },
    Hangup,
}

fn parse_control(text: &str) -> Option<ControlFrame> {
    serde_json::from_str(text).ok()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// GET /ws/:call_id — upgrade the switch's media connection.
pub async fn media_ws(
    ws: WebSocketUpgrade,
    Path(call_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_media(socket, state, call_id))
}

async fn handle_media(socket: WebSocket, state: AppState, call_id: String) {
    let (mut sink, mut stream) = socket.split();

    let Some((entry, held_metadata)) = bind_session(&state, &call_id, &mut stream).await
    else {
        tracing::warn!(call_id = %call_id, "orphan media socket, closing");
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: close_code::POLICY,
                reason: "no matching session".into(),
            })))
            .await;
        return;
    };

    // Hand the session its link and receive the paced-audio driver.
    let (in_tx, in_rx) = mpsc::channel(INBOUND_BUFFER);
    let (ready_tx, ready_rx) = oneshot::channel();
    if entry
        .commands
        .send(SessionCommand::Attach(SwitchLink {
            inbound: in_rx,
            ready: ready_tx,
        }))
        .await
        .is_err()
    {
        let _ = sink.send(Message::Close(None)).await;
        return;
    }
    let Ok(driver) = ready_rx.await else {
        let _ = sink.send(Message::Close(None)).await;
        return;
    };

    if let Some(frame) = held_metadata {
        forward_control(&in_tx, frame).await;
    }

    let mut writer = tokio::spawn(write_paced(sink, driver));
    read_media(&state, &call_id, &mut stream, &in_tx).await;

    // Closing the inbound channel tells the session the switch is gone;
    // the writer exits once the session drops its outbox.
    drop(in_tx);
    if tokio::time::timeout(Duration::from_secs(2), &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }
    tracing::info!(call_id = %call_id, "media socket closed");
}

/// Resolve the session for this socket within the orphan grace window.
/// An inbound `metadata` control frame creates the session on the spot.
async fn bind_session(
    state: &AppState,
    call_id: &str,
    stream: &mut SplitStream<WebSocket>,
) -> Option<(vox_sessions::registry::SessionEntry, Option<ControlFrame>)> {
    let deadline = tokio::time::Instant::now()
        + Duration::from_secs(state.config.switch.orphan_grace_secs);
    let mut poll = tokio::time::interval(Duration::from_millis(250));
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        if let Some(entry) = state.registry.get(call_id) {
            return Some((entry, None));
        }
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return None,
            _ = poll.tick() => {}
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Some(ControlFrame::Metadata { caller, called, switch_uuid }) =
                        parse_control(&text)
                    {
                        // No session and the switch is introducing the call:
                        // this is an inbound leg. Admission still applies.
                        match state.launcher.start_inbound(
                            call_id,
                            caller.clone().unwrap_or_default(),
                            called.clone().unwrap_or_default(),
                        ) {
                            Ok(()) => {
                                let entry = state.registry.get(call_id)?;
                                return Some((
                                    entry,
                                    Some(ControlFrame::Metadata { caller, called, switch_uuid }),
                                ));
                            }
                            Err(e) => {
                                tracing::warn!(call_id = %call_id, error = %e, "inbound admission denied");
                                return None;
                            }
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
                Some(Ok(_)) => {}
            }
        }
    }
}

/// Paced writer: one frame per 20 ms wall-clock tick, stale generations
/// already filtered by the outbox driver.
async fn write_paced(
    mut sink: SplitSink<WebSocket, Message>,
    mut driver: vox_sessions::AudioOutDriver,
) {
    let mut ticker = tokio::time::interval(Duration::from_millis(FRAME_MS));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        match driver.try_next() {
            FramePoll::Frame(pcm) => {
                if sink.send(Message::Binary(pcm)).await.is_err() {
                    return;
                }
            }
            FramePoll::Empty => {}
            FramePoll::Closed => {
                let _ = sink.send(Message::Close(None)).await;
                return;
            }
        }
    }
}

async fn read_media(
    state: &AppState,
    call_id: &str,
    stream: &mut SplitStream<WebSocket>,
    in_tx: &mpsc::Sender<SwitchInbound>,
) {
    let mut unknown = 0u64;
    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Binary(data) => {
                if data.len() == FRAME_BYTES {
                    if in_tx.send(SwitchInbound::Audio(data)).await.is_err() {
                        break;
                    }
                } else {
                    unknown += 1;
                }
            }
            Message::Text(text) => match parse_control(&text) {
                Some(frame) => {
                    forward_control(in_tx, frame).await;
                }
                None => unknown += 1,
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
    if unknown > 0 {
        tracing::debug!(call_id = %call_id, unknown, "ignored unparseable media frames");
        state.unknown_frames.fetch_add(unknown, Ordering::Relaxed);
    }
}

async fn forward_control(in_tx: &mpsc::Sender<SwitchInbound>, frame: ControlFrame) {
    let inbound = match frame {
        ControlFrame::Metadata {
            caller,
            called,
            switch_uuid,
        } => SwitchInbound::Metadata {
            caller,
            called,
            switch_uuid,
        },
        ControlFrame::Dtmf { digit } => SwitchInbound::Dtmf { digit },
        ControlFrame::Hangup => SwitchInbound::Hangup,
    };
    let _ = in_tx.send(inbound).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testutil::build_state;
    use futures_util::StreamExt as _;
    use std::sync::Arc;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    #[tokio::test]
    async fn orphan_socket_closes_with_policy_violation() {
        let dir = tempfile::tempdir().unwrap();
        let (mut state, _control) = build_state(dir.path());
        // Shrink the grace window so the test stays quick.
        let mut config = (*state.config).clone();
        config.switch.orphan_grace_secs = 1;
        state.config = Arc::new(config);
        let registry = state.registry.clone();

        let app = axum::Router::new()
            .route("/ws/:call_id", axum::routing::get(media_ws))
            .with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let (mut ws, _) =
            tokio_tungstenite::connect_async(format!("ws://{addr}/ws/unknown-id"))
                .await
                .unwrap();

        // Send nothing; the adapter must close with the policy code.
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            let msg = tokio::time::timeout_at(deadline, ws.next())
                .await
                .expect("socket should close within the grace window");
            match msg {
                Some(Ok(WsMessage::Close(Some(frame)))) => {
                    assert_eq!(u16::from(frame.code), 1008);
                    break;
                }
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => break,
            }
        }
        // No session was created for the unknown id.
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn parses_metadata_frame() {
        let frame = parse_control(
            r#"{"type":"metadata","caller":"+5511988887777","called":"+5511200001000"}"#,
        );
        match frame {
            Some(ControlFrame::Metadata { caller, called, .. }) => {
                assert_eq!(caller.as_deref(), Some("+5511988887777"));
                assert_eq!(called.as_deref(), Some("+5511200001000"));
            }
            other => panic!("expected metadata, got {other:?}"),
        }
    }

    #[test]
    fn parses_dtmf_and_hangup() {
        assert!(matches!(
            parse_control(r#"{"type":"dtmf","digit":"1"}"#),
            Some(ControlFrame::Dtmf { .. })
        ));
        assert!(matches!(
            parse_control(r#"{"type":"hangup"}"#),
            Some(ControlFrame::Hangup)
        ));
    }

    #[test]
    fn unknown_control_is_none() {
        assert!(parse_control(r#"{"type":"transfer"}"#).is_none());
        assert!(parse_control("not json").is_none());
    }
}
