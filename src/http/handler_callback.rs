//! Handles GET /callback/{provider_id} - Completes the round trip and reports the login

use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::Serialize;

use super::context::AppState;
use crate::connect::{CallbackOutcome, CallbackParams};
use crate::errors::ConnectError;

/// Result of a completed callback
#[derive(Clone, Serialize)]
#[cfg_attr(any(debug_assertions, test), derive(Debug))]
pub struct LoginResponse {
    /// `bound`, `auto_registered` or `temporary`
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub username: String,
    pub authorities: Vec<String>,
    pub provider_id: String,
    pub provider_user_id: String,
    pub redirect_to: String,
}

impl From<CallbackOutcome> for LoginResponse {
    fn from(outcome: CallbackOutcome) -> Self {
        Self {
            outcome: outcome.identity.outcome().to_string(),
            user_id: outcome.identity.user_id().map(str::to_string),
            username: outcome.identity.username().to_string(),
            authorities: outcome.identity.authorities().to_vec(),
            provider_id: outcome.profile.provider_id,
            provider_user_id: outcome.profile.provider_user_id,
            redirect_to: outcome.redirect_to,
        }
    }
}

pub async fn handle_callback(
    State(state): State<AppState>,
    Path(provider_id): Path<String>,
    Query(params): Query<CallbackParams>,
) -> Result<Json<LoginResponse>, ConnectError> {
    let outcome = state.processor.process(&provider_id, params).await?;
    tracing::info!(
        %provider_id,
        outcome = outcome.identity.outcome(),
        username = outcome.identity.username(),
        "login completed"
    );
    Ok(Json(outcome.into()))
}
