//! Builds the provider redirect for a new authorization round trip.

use super::ConnectSettings;
use crate::errors::ConnectError;
use crate::provider::ProviderRegistry;
use crate::state::{
    AuthorizationContext, AuthorizationContextStore, StateCache, StateCoder, generate_state,
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;

/// Where to send the user agent, and the state the provider will echo back
#[derive(Clone, PartialEq, Eq)]
#[cfg_attr(any(debug_assertions, test), derive(Debug))]
pub struct AuthorizationRedirect {
    pub url: String,
    pub state: String,
}

pub struct AuthorizationInitiator {
    registry: Arc<ProviderRegistry>,
    state_cache: Arc<dyn StateCache>,
    contexts: Arc<dyn AuthorizationContextStore>,
    coder: Option<Arc<dyn StateCoder>>,
    settings: Arc<ConnectSettings>,
}

impl AuthorizationInitiator {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        state_cache: Arc<dyn StateCache>,
        contexts: Arc<dyn AuthorizationContextStore>,
        coder: Option<Arc<dyn StateCoder>>,
        settings: Arc<ConnectSettings>,
    ) -> Self {
        Self {
            registry,
            state_cache,
            contexts,
            coder,
            settings,
        }
    }

    /// Start a round trip for `provider_id`. A caller-supplied state is used
    /// as-is; otherwise a random one is generated.
    pub async fn initiate(
        &self,
        provider_id: &str,
        state: Option<String>,
        params: HashMap<String, String>,
    ) -> Result<AuthorizationRedirect, ConnectError> {
        let client = self.registry.require(provider_id)?;

        let state = state
            .filter(|state| !state.is_empty())
            .unwrap_or_else(generate_state);
        let state = match &self.coder {
            Some(coder) => coder.encode(&state, &params),
            None => state,
        };

        let context = AuthorizationContext {
            provider_id: provider_id.to_string(),
            state: state.clone(),
            created_at: Utc::now(),
            params,
        };
        self.contexts
            .store(&context, self.settings.context_ttl)
            .await?;

        let key = self.settings.state_strategy.key(provider_id, &state);
        self.state_cache
            .cache(&key, &state, self.settings.state_ttl)
            .await?;

        let url = client.authorize_url(&state)?;
        tracing::debug!(provider_id, "authorization initiated");

        Ok(AuthorizationRedirect { url, state })
    }
}
