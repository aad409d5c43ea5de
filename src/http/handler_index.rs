//! Handles GET / - Reports the running version and configured providers

use axum::{Json, extract::State, response::IntoResponse};
use serde_json::json;

use super::context::AppState;

pub async fn handle_index(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "name": "social-connect",
        "version": state.version,
        "providers": state.registry.provider_ids(),
    }))
}
