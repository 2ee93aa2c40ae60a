//! Dashboard WebSocket: live call events and periodic stats.
//!
//! Server → client: `{type, data, timestamp}` for `call_started`,
//! `call_ended`, `call_state_changed`, `stats_updated`. Client → server:
//! `{"type":"ping"}` heartbeat and `{"type":"get_stats"}`.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

use vox_domain::call::LifecycleEvent;

use crate::state::AppState;

const STATS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Ping,
    GetStats,
}

pub async fn dashboard_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_dashboard(socket, state))
}

fn event_type(event: &LifecycleEvent) -> Option<&'static str> {
    match event {
        LifecycleEvent::CallStarted { .. } => Some("call_started"),
        LifecycleEvent::CallStateChanged { .. } => Some("call_state_changed"),
        LifecycleEvent::CallEnded { .. } => Some("call_ended"),
        // Failures reach the dashboard as the terminal call_ended.
        LifecycleEvent::CallFailed { .. } => None,
    }
}

async fn handle_dashboard(socket: WebSocket, state: AppState) {
    tracing::debug!("dashboard client connected");
    let (mut sink, mut stream) = socket.split();
    let mut events = state.registry.subscribe();
    let mut stats_tick = tokio::time::interval(STATS_INTERVAL);
    stats_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            ev = events.recv() => match ev {
                Ok(event) => {
                    let Some(kind) = event_type(&event) else { continue };
                    let payload = serde_json::json!({
                        "type": kind,
                        "data": event,
                        "timestamp": Utc::now(),
                    });
                    if sink.send(Message::Text(payload.to_string())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = stats_tick.tick() => {
                if send_stats(&mut sink, &state).await.is_err() {
                    break;
                }
            }
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(ClientMessage::Ping) => {}
                        Ok(ClientMessage::GetStats) => {
                            if send_stats(&mut sink, &state).await.is_err() {
                                break;
                            }
                        }
                        Err(_) => tracing::debug!("unparseable dashboard message"),
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
    }
    tracing::debug!("dashboard client disconnected");
}

async fn send_stats(
    sink: &mut (impl SinkExt<Message> + Unpin),
    state: &AppState,
) -> Result<(), ()> {
    let payload = serde_json::json!({
        "type": "stats_updated",
        "data": state.registry.snapshot(),
        "timestamp": Utc::now(),
    });
    sink.send(Message::Text(payload.to_string()))
        .await
        .map_err(|_| ())
}
