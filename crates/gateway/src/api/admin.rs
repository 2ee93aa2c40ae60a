//! Health probe and observability snapshot.

use std::sync::atomic::Ordering;

use axum::extract::State;
use axum::response::{IntoResponse, Json, Response};

use crate::state::AppState;

/// `GET /v1/health` — public liveness probe.
pub async fn health() -> Response {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
    .into_response()
}

/// `GET /v1/stats` — registry snapshot plus queue gauges.
pub async fn stats(State(state): State<AppState>) -> Response {
    let sessions = state.registry.snapshot();
    let campaigns = state.campaigns.list();
    let running_campaigns = campaigns
        .iter()
        .filter(|c| c.status == vox_domain::campaign::CampaignStatus::Running)
        .count();
    let pending_schedules = state
        .schedules
        .list()
        .iter()
        .filter(|s| s.status == vox_domain::schedule::ScheduleStatus::Pending)
        .count();

    Json(serde_json::json!({
        "sessions": sessions,
        "campaigns": {
            "total": campaigns.len(),
            "running": running_campaigns,
        },
        "schedules": { "pending": pending_schedules },
        "webhooks": { "configured": state.webhooks.list().len() },
        "media": {
            "unknown_frames": state.unknown_frames.load(Ordering::Relaxed),
            "greeting_cache": state.greetings.len(),
        },
    }))
    .into_response()
}
