pub mod admin;
pub mod auth;
pub mod calls;
pub mod campaigns;
pub mod cors;
pub mod dashboard;
pub mod prompts;
pub mod schedules;
pub mod settings;
pub mod webhooks;

use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post, put};
use axum::Router;

use vox_domain::error::Error;

use crate::state::AppState;

/// Build a standardized JSON error response: `{ "error": "<message>" }`.
pub(crate) fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": message.into() })),
    )
        .into_response()
}

/// Map a domain error onto the control surface's status contract:
/// 400 validation, 404 not found, 409 state conflict, 500 otherwise.
pub(crate) fn error_response(err: Error) -> Response {
    let status = match &err {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Conflict(_) | Error::Capacity(_) => StatusCode::CONFLICT,
        Error::Config(_) | Error::Other(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, err.to_string())
}

/// Build the full router.
///
/// Routes split into **public** (health, the switch's media socket, and
/// the dashboard socket — none of which can carry operator tokens) and
/// **protected** (everything else, behind the bearer-token middleware).
pub fn router(state: AppState) -> Router<AppState> {
    let public = Router::new()
        .route("/v1/health", get(admin::health))
        .route("/ws/:call_id", get(crate::switch::media::media_ws))
        .route("/dashboard", get(dashboard::dashboard_ws));

    let protected = Router::new()
        // Calls
        .route("/v1/calls/dial", post(calls::dial))
        .route("/v1/calls/active", get(calls::active))
        .route("/v1/calls", get(calls::list))
        .route("/v1/calls/:call_id", get(calls::get_call))
        .route("/v1/calls/:call_id", delete(calls::delete_call))
        .route("/v1/calls/:call_id/hangup", post(calls::hangup))
        // Prompts
        .route("/v1/prompts", get(prompts::list))
        .route("/v1/prompts", post(prompts::create))
        .route("/v1/prompts/:id", get(prompts::get_prompt))
        .route("/v1/prompts/:id", put(prompts::update))
        .route("/v1/prompts/:id", delete(prompts::delete_prompt))
        .route("/v1/prompts/:id/activate", post(prompts::activate))
        // Campaigns
        .route("/v1/campaigns", get(campaigns::list))
        .route("/v1/campaigns", post(campaigns::create))
        .route("/v1/campaigns/:id", get(campaigns::get_campaign))
        .route("/v1/campaigns/:id", delete(campaigns::delete_campaign))
        .route("/v1/campaigns/:id/start", post(campaigns::start))
        .route("/v1/campaigns/:id/pause", post(campaigns::pause))
        .route("/v1/campaigns/:id/contacts", get(campaigns::contacts))
        .route(
            "/v1/campaigns/:id/contacts/import",
            post(campaigns::import_contacts),
        )
        // Schedules
        .route("/v1/schedules", get(schedules::list))
        .route("/v1/schedules", post(schedules::create))
        .route("/v1/schedules/:id", get(schedules::get_schedule))
        .route("/v1/schedules/:id", delete(schedules::cancel))
        // Webhooks
        .route("/v1/webhooks", get(webhooks::list))
        .route("/v1/webhooks", post(webhooks::create))
        .route("/v1/webhooks/:id", get(webhooks::get_webhook))
        .route("/v1/webhooks/:id", put(webhooks::update))
        .route("/v1/webhooks/:id", delete(webhooks::delete_webhook))
        .route("/v1/webhooks/:id/deliveries", get(webhooks::deliveries))
        // Settings
        .route("/v1/settings", get(settings::list))
        .route("/v1/settings", put(settings::update))
        .route("/v1/settings/reload", post(settings::reload))
        // Observability
        .route("/v1/stats", get(admin::stats))
        .layer(middleware::from_fn_with_state(
            state,
            auth::require_api_token,
        ));

    public.merge(protected)
}
