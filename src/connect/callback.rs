//! Provider callback processing.
//!
//! One round trip moves through
//! `Initiated -> CodeReceived -> StateValidated -> TokenExchanged -> UserFetched -> IdentityResolved`
//! and ends in `Bound`, `AutoRegistered`, `Temporary` or `Failed`.

use super::ConnectSettings;
use super::identity::{IdentityResolver, ResolvedIdentity};
use crate::errors::ConnectError;
use crate::provider::{ExternalProfile, ProviderRegistry};
use crate::state::{AuthorizationContextStore, StateCache, StateCoder};
use chrono::Utc;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackStage {
    Initiated,
    CodeReceived,
    StateValidated,
    TokenExchanged,
    UserFetched,
    IdentityResolved,
    Bound,
    AutoRegistered,
    Temporary,
    Failed,
}

impl CallbackStage {
    fn terminal(identity: &ResolvedIdentity) -> Self {
        match identity {
            ResolvedIdentity::Bound(_) => Self::Bound,
            ResolvedIdentity::AutoRegistered(_) => Self::AutoRegistered,
            ResolvedIdentity::Temporary(_) => Self::Temporary,
        }
    }
}

impl fmt::Display for CallbackStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initiated => "initiated",
            Self::CodeReceived => "code_received",
            Self::StateValidated => "state_validated",
            Self::TokenExchanged => "token_exchanged",
            Self::UserFetched => "user_fetched",
            Self::IdentityResolved => "identity_resolved",
            Self::Bound => "bound",
            Self::AutoRegistered => "auto_registered",
            Self::Temporary => "temporary",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Query parameters a provider sends to the callback endpoint
#[derive(Clone, Default, Deserialize)]
#[cfg_attr(any(debug_assertions, test), derive(Debug))]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

#[derive(Clone)]
#[cfg_attr(any(debug_assertions, test), derive(Debug))]
pub struct CallbackOutcome {
    pub identity: ResolvedIdentity,
    pub profile: ExternalProfile,
    /// Decoded redirect target, sign-up URL for temporary identities, or the default target
    pub redirect_to: String,
}

impl CallbackOutcome {
    pub fn stage(&self) -> CallbackStage {
        CallbackStage::terminal(&self.identity)
    }
}

pub struct CallbackProcessor {
    registry: Arc<ProviderRegistry>,
    state_cache: Arc<dyn StateCache>,
    contexts: Arc<dyn AuthorizationContextStore>,
    coder: Option<Arc<dyn StateCoder>>,
    resolver: Arc<IdentityResolver>,
    settings: Arc<ConnectSettings>,
}

impl CallbackProcessor {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        state_cache: Arc<dyn StateCache>,
        contexts: Arc<dyn AuthorizationContextStore>,
        coder: Option<Arc<dyn StateCoder>>,
        resolver: Arc<IdentityResolver>,
        settings: Arc<ConnectSettings>,
    ) -> Self {
        Self {
            registry,
            state_cache,
            contexts,
            coder,
            resolver,
            settings,
        }
    }

    pub fn resolver(&self) -> &Arc<IdentityResolver> {
        &self.resolver
    }

    pub async fn process(
        &self,
        provider_id: &str,
        params: CallbackParams,
    ) -> Result<CallbackOutcome, ConnectError> {
        let mut stage = CallbackStage::Initiated;
        let result = self.run(provider_id, params, &mut stage).await;

        match &result {
            Ok(outcome) => {
                tracing::debug!(provider_id, stage = %outcome.stage(), "callback completed");
            }
            Err(error) => {
                tracing::debug!(
                    provider_id,
                    stage = %CallbackStage::Failed,
                    last_stage = %stage,
                    error = %error,
                    "callback failed"
                );
            }
        }
        result
    }

    async fn run(
        &self,
        provider_id: &str,
        params: CallbackParams,
        stage: &mut CallbackStage,
    ) -> Result<CallbackOutcome, ConnectError> {
        let client = self.registry.require(provider_id)?;

        if let Some(error) = params.error {
            let description = params.error_description.unwrap_or_default();
            return Err(ConnectError::ProviderProtocol(format!(
                "{provider_id} returned {error}: {description}"
            )));
        }

        let code = params
            .code
            .filter(|code| !code.is_empty())
            .ok_or_else(|| {
                ConnectError::ProviderProtocol(format!("{provider_id} callback without code"))
            })?;
        let state = params
            .state
            .filter(|state| !state.is_empty())
            .ok_or_else(|| ConnectError::CsrfState("callback without state".to_string()))?;
        advance(stage, CallbackStage::CodeReceived, provider_id);

        let context = self.contexts.pop(&state).await?.ok_or_else(|| {
            ConnectError::CsrfState("no authorization in progress for this state".to_string())
        })?;
        if context.provider_id != provider_id {
            return Err(ConnectError::CsrfState(format!(
                "authorization was started for {}",
                context.provider_id
            )));
        }

        if self.settings.state_validation {
            let key = self.settings.state_strategy.key(provider_id, &state);
            match self.state_cache.get(&key).await? {
                Some(cached) if cached == state => self.state_cache.remove(&key).await?,
                Some(_) => {
                    return Err(ConnectError::CsrfState("state mismatch".to_string()));
                }
                None => {
                    return Err(ConnectError::CsrfState(
                        "state expired or already used".to_string(),
                    ));
                }
            }
        }
        advance(stage, CallbackStage::StateValidated, provider_id);

        let token = client.exchange_token(&code).await?;
        advance(stage, CallbackStage::TokenExchanged, provider_id);

        let profile = client.fetch_user_info(&token).await?;
        advance(stage, CallbackStage::UserFetched, provider_id);

        let identity = self.resolver.resolve(&profile, Utc::now()).await?;
        advance(stage, CallbackStage::IdentityResolved, provider_id);

        let redirect_to = match &identity {
            ResolvedIdentity::Temporary(_) => self.settings.sign_up_url.clone(),
            _ => self
                .coder
                .as_ref()
                .and_then(|coder| coder.decode(&state).redirect)
                .unwrap_or_else(|| self.settings.default_target_url.clone()),
        };

        Ok(CallbackOutcome {
            identity,
            profile,
            redirect_to,
        })
    }
}

fn advance(stage: &mut CallbackStage, next: CallbackStage, provider_id: &str) {
    tracing::debug!(provider_id, from = %stage, to = %next, "callback stage");
    *stage = next;
}
