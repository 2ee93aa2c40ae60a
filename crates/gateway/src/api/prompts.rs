//! Prompt CRUD and activation.
//!
//! Creating, updating, or activating a prompt with a greeting kicks off a
//! background pre-synthesis so the first caller hears the greeting with
//! no provider round-trip; the measured duration lands on the prompt row.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use uuid::Uuid;

use vox_domain::prompt::Prompt;
use vox_store::prompts::PromptInput;

use crate::api::{api_error, error_response};
use crate::state::AppState;

fn validate(input: &PromptInput) -> Option<Response> {
    if input.name.trim().is_empty() {
        return Some(api_error(StatusCode::BAD_REQUEST, "name must not be empty"));
    }
    if input.system_text.trim().is_empty() {
        return Some(api_error(
            StatusCode::BAD_REQUEST,
            "system_text must not be empty",
        ));
    }
    if !(0.0..=2.0).contains(&input.temperature) {
        return Some(api_error(
            StatusCode::BAD_REQUEST,
            "temperature must be between 0.0 and 2.0",
        ));
    }
    None
}

fn warm_greeting(state: &AppState, prompt: Prompt) {
    if prompt.greeting.is_none() {
        return;
    }
    let state = state.clone();
    tokio::spawn(async move {
        match state.launcher.presynthesize_greeting(&prompt).await {
            Ok(duration_ms) if duration_ms > 0 => {
                state.prompts.set_greeting_duration(&prompt.id, duration_ms);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(prompt = %prompt.name, error = %e, "greeting pre-synthesis failed");
            }
        }
    });
}

/// `GET /v1/prompts`
pub async fn list(State(state): State<AppState>) -> Response {
    Json(state.prompts.list()).into_response()
}

/// `POST /v1/prompts`
pub async fn create(
    State(state): State<AppState>,
    Json(input): Json<PromptInput>,
) -> Response {
    if let Some(resp) = validate(&input) {
        return resp;
    }
    match state.prompts.create(input) {
        Ok(prompt) => {
            warm_greeting(&state, prompt.clone());
            (StatusCode::CREATED, Json(prompt)).into_response()
        }
        Err(e) => error_response(e),
    }
}

/// `GET /v1/prompts/:id`
pub async fn get_prompt(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Response {
    match state.prompts.get(&id) {
        Some(prompt) => Json(prompt).into_response(),
        None => api_error(StatusCode::NOT_FOUND, format!("prompt {id}")),
    }
}

/// `PUT /v1/prompts/:id`
pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(input): Json<PromptInput>,
) -> Response {
    if let Some(resp) = validate(&input) {
        return resp;
    }
    match state.prompts.update(&id, input) {
        Ok(prompt) => {
            warm_greeting(&state, prompt.clone());
            Json(prompt).into_response()
        }
        Err(e) => error_response(e),
    }
}

/// `POST /v1/prompts/:id/activate` — atomic swap; in-flight calls keep
/// their snapshot.
pub async fn activate(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Response {
    match state.prompts.activate(&id) {
        Ok(prompt) => {
            warm_greeting(&state, prompt.clone());
            Json(prompt).into_response()
        }
        Err(e) => error_response(e),
    }
}

/// `DELETE /v1/prompts/:id`
pub async fn delete_prompt(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Response {
    match state.prompts.delete(&id) {
        Ok(()) => Json(serde_json::json!({ "deleted": id })).into_response(),
        Err(e) => error_response(e),
    }
}
