//! External identity providers: client contract, configuration and registry.

pub mod config;
pub mod registry;
pub mod standard;

pub use config::{ProviderConfig, ProviderKind, UserFieldMapping};
pub use registry::ProviderRegistry;
pub use standard::StandardOAuth2Client;

use crate::errors::{ConnectError, RefreshError};
use crate::storage::traits::{NEVER_EXPIRES, TokenRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Token returned by a provider's token endpoint
#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(any(debug_assertions, test), derive(Debug))]
pub struct ProviderToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Lifetime in seconds, when the provider reports one
    pub expires_in: Option<i64>,
    pub token_type: Option<String>,
    pub scope: Option<String>,
}

impl ProviderToken {
    /// Absolute expiry in epoch millis, or [`NEVER_EXPIRES`]. Lifetimes too
    /// large to represent are treated as never expiring.
    pub fn expire_time_from(&self, now: DateTime<Utc>) -> i64 {
        match self.expires_in {
            Some(seconds) if seconds > 0 => seconds
                .checked_mul(1000)
                .and_then(|millis| now.timestamp_millis().checked_add(millis))
                .unwrap_or(NEVER_EXPIRES),
            _ => NEVER_EXPIRES,
        }
    }

    /// Unsaved token record for this token
    pub fn to_token_record(&self, provider_id: &str, now: DateTime<Utc>) -> TokenRecord {
        TokenRecord {
            id: 0,
            provider_id: provider_id.to_string(),
            access_token: self.access_token.clone(),
            refresh_token: self.refresh_token.clone(),
            token_type: self.token_type.clone(),
            scope: self.scope.clone(),
            expire_time: self.expire_time_from(now),
            enable_refresh: true,
            updated_at: now,
        }
    }
}

/// User profile fetched from a provider
#[derive(Clone, Serialize, Deserialize)]
#[cfg_attr(any(debug_assertions, test), derive(Debug))]
pub struct ExternalProfile {
    pub provider_id: String,
    pub provider_user_id: String,
    pub username: String,
    pub nickname: Option<String>,
    pub avatar: Option<String>,
    pub profile_url: Option<String>,
    pub email: Option<String>,
    /// Unmodified user info document
    pub raw: serde_json::Value,
    pub token: ProviderToken,
}

/// Contract every provider implementation fulfils
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Configured provider id, e.g. `github`
    fn provider_id(&self) -> &str;

    /// Authorization endpoint URL carrying client id, scope, redirect URI and state
    fn authorize_url(&self, state: &str) -> Result<String, ConnectError>;

    /// Exchange an authorization code for a token
    async fn exchange_token(&self, code: &str) -> Result<ProviderToken, ConnectError>;

    /// Fetch the profile of the user the token was issued for
    async fn fetch_user_info(&self, token: &ProviderToken) -> Result<ExternalProfile, ConnectError>;

    /// Refresh a stored token. Returns [`RefreshError::Unsupported`] when the
    /// provider cannot refresh this token at all.
    async fn refresh_token(&self, token: &TokenRecord) -> Result<TokenRecord, RefreshError>;
}
