//! Webhook configuration endpoints and the delivery log.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use uuid::Uuid;

use vox_store::webhooks::WebhookInput;

use crate::api::{api_error, error_response};
use crate::state::AppState;

fn validate(input: &WebhookInput) -> Option<Response> {
    if !input.url.starts_with("http://") && !input.url.starts_with("https://") {
        return Some(api_error(
            StatusCode::BAD_REQUEST,
            "url must be http(s)",
        ));
    }
    let known = [
        "call.started",
        "call.state_changed",
        "call.ended",
        "call.failed",
    ];
    for event in &input.events {
        if !known.contains(&event.as_str()) {
            return Some(api_error(
                StatusCode::BAD_REQUEST,
                format!("unknown event {event:?}"),
            ));
        }
    }
    None
}

/// `GET /v1/webhooks`
pub async fn list(State(state): State<AppState>) -> Response {
    Json(state.webhooks.list()).into_response()
}

/// `POST /v1/webhooks`
pub async fn create(
    State(state): State<AppState>,
    Json(input): Json<WebhookInput>,
) -> Response {
    if let Some(resp) = validate(&input) {
        return resp;
    }
    match state.webhooks.create(input) {
        Ok(config) => (StatusCode::CREATED, Json(config)).into_response(),
        Err(e) => error_response(e),
    }
}

/// `GET /v1/webhooks/:id`
pub async fn get_webhook(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Response {
    match state.webhooks.get(&id) {
        Some(config) => Json(config).into_response(),
        None => api_error(StatusCode::NOT_FOUND, format!("webhook {id}")),
    }
}

/// `PUT /v1/webhooks/:id`
pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(input): Json<WebhookInput>,
) -> Response {
    if let Some(resp) = validate(&input) {
        return resp;
    }
    match state.webhooks.update(&id, input) {
        Ok(config) => Json(config).into_response(),
        Err(e) => error_response(e),
    }
}

/// `DELETE /v1/webhooks/:id`
pub async fn delete_webhook(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Response {
    match state.webhooks.delete(&id) {
        Ok(()) => Json(serde_json::json!({ "deleted": id })).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
pub struct DeliveriesQuery {
    #[serde(default = "d_limit")]
    limit: usize,
}

fn d_limit() -> usize {
    50
}

/// `GET /v1/webhooks/:id/deliveries` — recent attempts, newest first.
pub async fn deliveries(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<DeliveriesQuery>,
) -> Response {
    if state.webhooks.get(&id).is_none() {
        return api_error(StatusCode::NOT_FOUND, format!("webhook {id}"));
    }
    Json(state.webhooks.deliveries(&id, query.limit.clamp(1, 500))).into_response()
}
