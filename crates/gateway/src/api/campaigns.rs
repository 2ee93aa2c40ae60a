//! Campaign endpoints: CRUD, start/pause, CSV contact import.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use uuid::Uuid;

use vox_domain::campaign::{MAX_CONCURRENT_CEIL, MAX_CONCURRENT_FLOOR};

use crate::api::{api_error, error_response};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct CreateCampaign {
    pub name: String,
    #[serde(default)]
    pub prompt_id: Option<Uuid>,
    #[serde(default = "d_max_concurrent")]
    pub max_concurrent: u32,
}

fn d_max_concurrent() -> u32 {
    2
}

/// `POST /v1/campaigns`
pub async fn create(
    State(state): State<AppState>,
    Json(req): Json<CreateCampaign>,
) -> Response {
    if req.name.trim().is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "name must not be empty");
    }
    if !(MAX_CONCURRENT_FLOOR..=MAX_CONCURRENT_CEIL).contains(&req.max_concurrent) {
        return api_error(
            StatusCode::BAD_REQUEST,
            format!("max_concurrent must be {MAX_CONCURRENT_FLOOR}–{MAX_CONCURRENT_CEIL}"),
        );
    }
    if let Some(prompt_id) = req.prompt_id {
        if state.prompts.get(&prompt_id).is_none() {
            return api_error(StatusCode::NOT_FOUND, format!("prompt {prompt_id}"));
        }
    }
    match state
        .campaigns
        .create(req.name, req.prompt_id, req.max_concurrent)
    {
        Ok(campaign) => (StatusCode::CREATED, Json(campaign)).into_response(),
        Err(e) => error_response(e),
    }
}

/// `GET /v1/campaigns`
pub async fn list(State(state): State<AppState>) -> Response {
    Json(state.campaigns.list()).into_response()
}

/// `GET /v1/campaigns/:id` — campaign plus contact counts.
pub async fn get_campaign(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Response {
    let Some(campaign) = state.campaigns.get(&id) else {
        return api_error(StatusCode::NOT_FOUND, format!("campaign {id}"));
    };
    let (pending, calling, completed, failed) = state.campaigns.counts(&id);
    Json(serde_json::json!({
        "campaign": campaign,
        "contacts": {
            "pending": pending,
            "calling": calling,
            "completed": completed,
            "failed": failed,
            "total": pending + calling + completed + failed,
        },
    }))
    .into_response()
}

/// `POST /v1/campaigns/:id/start`
pub async fn start(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.campaign_runner.start(&state, id) {
        Ok(campaign) => Json(campaign).into_response(),
        Err(e) => error_response(e),
    }
}

/// `POST /v1/campaigns/:id/pause` — cooperative; in-flight calls finish.
pub async fn pause(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.campaign_runner.pause(&state, id) {
        Ok(campaign) => Json(campaign).into_response(),
        Err(e) => error_response(e),
    }
}

/// `POST /v1/campaigns/:id/contacts/import` — CSV body, header row
/// required (`phone_number` mandatory, `name` optional, extra columns
/// stored as contact metadata).
pub async fn import_contacts(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Bytes,
) -> Response {
    if body.is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "empty CSV body");
    }
    match state.campaigns.import_csv(&id, &body) {
        Ok(report) => Json(report).into_response(),
        Err(e) => error_response(e),
    }
}

/// `GET /v1/campaigns/:id/contacts`
pub async fn contacts(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    if state.campaigns.get(&id).is_none() {
        return api_error(StatusCode::NOT_FOUND, format!("campaign {id}"));
    }
    Json(state.campaigns.contacts(&id)).into_response()
}

/// `DELETE /v1/campaigns/:id`
pub async fn delete_campaign(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Response {
    if state.campaign_runner.is_running(&id) {
        return api_error(StatusCode::CONFLICT, "pause the campaign before deleting");
    }
    match state.campaigns.delete(&id) {
        Ok(()) => Json(serde_json::json!({ "deleted": id })).into_response(),
        Err(e) => error_response(e),
    }
}
