//! Scheduled-call endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::api::{api_error, error_response};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct CreateSchedule {
    pub phone_number: String,
    pub scheduled_time: DateTime<Utc>,
    #[serde(default)]
    pub prompt_id: Option<Uuid>,
}

/// `POST /v1/schedules`
pub async fn create(
    State(state): State<AppState>,
    Json(req): Json<CreateSchedule>,
) -> Response {
    if !crate::dialer::valid_number(&req.phone_number) {
        return api_error(StatusCode::BAD_REQUEST, "invalid phone number");
    }
    if let Some(prompt_id) = req.prompt_id {
        if state.prompts.get(&prompt_id).is_none() {
            return api_error(StatusCode::NOT_FOUND, format!("prompt {prompt_id}"));
        }
    }
    match state
        .schedules
        .create(req.phone_number, req.scheduled_time, req.prompt_id)
    {
        Ok(schedule) => (StatusCode::CREATED, Json(schedule)).into_response(),
        Err(e) => error_response(e),
    }
}

/// `GET /v1/schedules`
pub async fn list(State(state): State<AppState>) -> Response {
    Json(state.schedules.list()).into_response()
}

/// `GET /v1/schedules/:id`
pub async fn get_schedule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Response {
    match state.schedules.get(&id) {
        Some(schedule) => Json(schedule).into_response(),
        None => api_error(StatusCode::NOT_FOUND, format!("schedule {id}")),
    }
}

/// `DELETE /v1/schedules/:id` — cancellation; only pending rows qualify.
pub async fn cancel(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.schedules.cancel(&id) {
        Ok(schedule) => Json(schedule).into_response(),
        Err(e) => error_response(e),
    }
}
