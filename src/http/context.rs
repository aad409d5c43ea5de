//! Application state shared by every handler.

use axum::extract::FromRef;
use std::sync::Arc;

use crate::connect::{AuthorizationInitiator, CallbackProcessor};
use crate::provider::ProviderRegistry;

#[derive(Clone)]
pub struct AppState {
    pub version: String,
    pub registry: Arc<ProviderRegistry>,
    /// Builds provider redirects for `/authorize/{provider_id}`
    pub initiator: Arc<AuthorizationInitiator>,
    /// Completes `/callback/{provider_id}`
    pub processor: Arc<CallbackProcessor>,
}

impl FromRef<AppState> for Arc<ProviderRegistry> {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.registry.clone()
    }
}
