//! Settings endpoints: key/value overlay with live reload.

use std::collections::HashMap;

use axum::extract::State;
use axum::response::{IntoResponse, Json, Response};

use crate::api::error_response;
use crate::engine::apply_settings;
use crate::state::AppState;

/// `GET /v1/settings` — secretish values are masked.
pub async fn list(State(state): State<AppState>) -> Response {
    let snapshot = state.settings.snapshot();
    let view: HashMap<String, String> = snapshot
        .iter()
        .map(|(k, v)| {
            if k.contains("api_key") || k.contains("secret") {
                (k.clone(), mask(v))
            } else {
                (k.clone(), v.clone())
            }
        })
        .collect();
    Json(view).into_response()
}

fn mask(value: &str) -> String {
    let chars = value.chars().count();
    if chars <= 4 {
        "****".into()
    } else {
        let tail: String = value.chars().skip(chars - 4).collect();
        format!("****{tail}")
    }
}

/// `PUT /v1/settings` — merge values, then push the runtime-adjustable
/// ones (concurrency cap, provider keys) into the live components.
pub async fn update(
    State(state): State<AppState>,
    Json(values): Json<HashMap<String, String>>,
) -> Response {
    if let Err(e) = state.settings.set_many(values) {
        return error_response(e);
    }
    apply_settings(&state.settings, &state.registry, &state.launcher);
    Json(serde_json::json!({ "updated": true })).into_response()
}

/// `POST /v1/settings/reload` — re-read the backing file without restart.
pub async fn reload(State(state): State<AppState>) -> Response {
    let count = state.settings.reload();
    apply_settings(&state.settings, &state.registry, &state.launcher);
    Json(serde_json::json!({ "reloaded": count })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masking_keeps_a_tail() {
        assert_eq!(mask("sk-1234567890"), "****7890");
        assert_eq!(mask("abc"), "****");
    }
}
