//! The authorization round trip: redirect to the provider, then turn its
//! callback into a bound, auto-registered or temporary local identity.

pub mod callback;
pub mod identity;
pub mod initiator;

pub use callback::{CallbackOutcome, CallbackParams, CallbackProcessor, CallbackStage};
pub use identity::{IdentityResolver, ResolvedIdentity, TemporaryIdentity, username_candidates};
pub use initiator::{AuthorizationInitiator, AuthorizationRedirect};

use crate::state::StateKeyStrategy;
use std::time::Duration;

/// Behaviour switches for the authorization round trip
#[derive(Clone)]
#[cfg_attr(any(debug_assertions, test), derive(Debug))]
pub struct ConnectSettings {
    pub state_strategy: StateKeyStrategy,
    pub state_ttl: Duration,
    /// Off for deployments that validate state themselves
    pub state_validation: bool,
    pub context_ttl: Duration,
    pub auto_sign_up: bool,
    pub default_authorities: Vec<String>,
    pub temporary_authorities: Vec<String>,
    pub temporary_password: String,
    pub sign_up_url: String,
    pub default_target_url: String,
}

impl Default for ConnectSettings {
    fn default() -> Self {
        Self {
            state_strategy: StateKeyStrategy::Random,
            state_ttl: Duration::from_secs(180),
            state_validation: true,
            context_ttl: Duration::from_secs(180),
            auto_sign_up: true,
            default_authorities: vec!["ROLE_USER".to_string()],
            temporary_authorities: vec!["ROLE_TEMPORARY_USER".to_string()],
            temporary_password: crate::state::generate_state(),
            sign_up_url: "/signup".to_string(),
            default_target_url: "/".to_string(),
        }
    }
}
