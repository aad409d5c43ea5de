//! Handles GET /authorize/{provider_id} - Starts an authorization round trip

use axum::{
    extract::{Path, Query, State},
    response::Redirect,
};
use std::collections::HashMap;

use super::context::AppState;
use crate::errors::ConnectError;

/// Query parameters other than `state` (e.g. `redirect`) are kept with the
/// authorization context and handed to the state coder.
pub async fn handle_authorize(
    State(state): State<AppState>,
    Path(provider_id): Path<String>,
    Query(mut params): Query<HashMap<String, String>>,
) -> Result<Redirect, ConnectError> {
    let caller_state = params.remove("state");
    let redirect = state
        .initiator
        .initiate(&provider_id, caller_state, params)
        .await?;
    Ok(Redirect::to(&redirect.url))
}
