//! Call endpoints: dial, hangup, live list, history.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use uuid::Uuid;

use vox_domain::call::CallOrigin;

use crate::api::{api_error, error_response};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct DialRequest {
    pub number: String,
    #[serde(default)]
    pub prompt_id: Option<Uuid>,
}

/// `POST /v1/calls/dial`
pub async fn dial(
    State(state): State<AppState>,
    Json(req): Json<DialRequest>,
) -> Response {
    if !crate::dialer::valid_number(&req.number) {
        return api_error(StatusCode::BAD_REQUEST, "invalid phone number");
    }
    let prompt = match state.launcher.resolve_prompt(req.prompt_id) {
        Ok(p) => p,
        Err(e) => return error_response(e),
    };
    match state
        .dialer
        .dial(&req.number, prompt, CallOrigin::Operator, None)
        .await
    {
        Ok(call_id) => (
            StatusCode::CREATED,
            Json(serde_json::json!({ "call_id": call_id })),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

/// `POST /v1/calls/:call_id/hangup`
pub async fn hangup(
    State(state): State<AppState>,
    Path(call_id): Path<String>,
) -> Response {
    match state.dialer.hangup(&call_id).await {
        Ok(()) => Json(serde_json::json!({ "call_id": call_id, "status": "hanging_up" }))
            .into_response(),
        Err(e) => error_response(e),
    }
}

/// `GET /v1/calls/active`
pub async fn active(State(state): State<AppState>) -> Response {
    let sessions = state.registry.list();
    Json(serde_json::json!({
        "count": sessions.len(),
        "sessions": sessions,
    }))
    .into_response()
}

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default = "d_page")]
    page: usize,
    #[serde(default = "d_per_page")]
    per_page: usize,
    #[serde(default)]
    status: Option<String>,
}

fn d_page() -> usize {
    1
}
fn d_per_page() -> usize {
    20
}

/// `GET /v1/calls?page&per_page&status`
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Response {
    let per_page = query.per_page.clamp(1, 100);
    let (calls, total) = state
        .calls
        .list(query.page, per_page, query.status.as_deref());
    Json(serde_json::json!({
        "calls": calls,
        "total": total,
        "page": query.page.max(1),
        "per_page": per_page,
    }))
    .into_response()
}

/// `GET /v1/calls/:call_id` — includes the committed transcript. For a
/// live call the FSM's current state overrides the persisted row.
pub async fn get_call(
    State(state): State<AppState>,
    Path(call_id): Path<String>,
) -> Response {
    let Some(mut record) = state.calls.get(&call_id) else {
        return api_error(StatusCode::NOT_FOUND, format!("call {call_id}"));
    };
    if let Some(entry) = state.registry.get(&call_id) {
        record.state = entry.state.get();
    }
    Json(record).into_response()
}

/// `DELETE /v1/calls/:call_id`
pub async fn delete_call(
    State(state): State<AppState>,
    Path(call_id): Path<String>,
) -> Response {
    if state.registry.contains(&call_id) {
        return api_error(
            StatusCode::CONFLICT,
            "call is live; hang it up before deleting",
        );
    }
    match state.calls.delete(&call_id) {
        Ok(()) => Json(serde_json::json!({ "deleted": call_id })).into_response(),
        Err(e) => error_response(e),
    }
}
