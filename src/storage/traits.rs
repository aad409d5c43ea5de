//! Storage trait definitions for provider connections, tokens and local identities.
//!
//! Defines async storage interfaces that can be implemented by various backend
//! providers. Access and refresh tokens cross these interfaces in plaintext;
//! encryption at rest is applied by [`crate::storage::cipher::EncryptedStorage`].

use crate::errors::StorageError;
use crate::provider::ExternalProfile;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, StorageError>;

/// `expire_time` value for tokens that never expire
pub const NEVER_EXPIRES: i64 = -1;

/// Provider token persisted for a connection
#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(any(debug_assertions, test), derive(Debug))]
pub struct TokenRecord {
    /// Surrogate key, assigned by the store on insert
    pub id: i64,
    pub provider_id: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: Option<String>,
    pub scope: Option<String>,
    /// Epoch millis, or [`NEVER_EXPIRES`]
    pub expire_time: i64,
    /// Cleared permanently once the provider reports refresh as unsupported
    pub enable_refresh: bool,
    pub updated_at: DateTime<Utc>,
}

impl TokenRecord {
    pub fn never_expires(&self) -> bool {
        self.expire_time == NEVER_EXPIRES
    }

    /// Whether the scheduler should refresh this token before `deadline` (epoch millis)
    pub fn is_refresh_candidate(&self, deadline: i64) -> bool {
        self.enable_refresh && !self.never_expires() && self.expire_time < deadline
    }
}

/// Binding between a local user and an external provider account
#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(any(debug_assertions, test), derive(Debug))]
pub struct Connection {
    pub user_id: String,
    pub provider_id: String,
    pub provider_user_id: String,
    /// Ordinal among the user's connections to the same provider, starting at 1
    pub rank: i32,
    pub display_name: Option<String>,
    pub profile_url: Option<String>,
    pub image_url: Option<String>,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expire_time: i64,
    pub token_id: Option<i64>,
}

impl Connection {
    /// Build an unsaved connection from a fetched profile; the store assigns the rank.
    pub fn from_profile(user_id: &str, profile: &ExternalProfile, token: &TokenRecord) -> Self {
        Self {
            user_id: user_id.to_string(),
            provider_id: profile.provider_id.clone(),
            provider_user_id: profile.provider_user_id.clone(),
            rank: 0,
            display_name: profile.nickname.clone().or_else(|| Some(profile.username.clone())),
            profile_url: profile.profile_url.clone(),
            image_url: profile.avatar.clone(),
            access_token: token.access_token.clone(),
            refresh_token: token.refresh_token.clone(),
            expire_time: token.expire_time,
            token_id: Some(token.id),
        }
    }

    /// Copy the fields a refreshed token carries.
    pub fn apply_token(&mut self, token: &TokenRecord) {
        self.access_token = token.access_token.clone();
        self.refresh_token = token.refresh_token.clone();
        self.expire_time = token.expire_time;
    }
}

/// Local principal resolved for a login
#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(any(debug_assertions, test), derive(Debug))]
pub struct LocalIdentity {
    pub user_id: String,
    pub username: String,
    pub authorities: Vec<String>,
    pub nickname: Option<String>,
    pub avatar: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Trait for storing and retrieving provider tokens
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Insert a token and return its assigned id. The `id` field of the input is ignored.
    async fn insert_token(&self, token: &TokenRecord) -> Result<i64>;

    /// Retrieve a token by id
    async fn get_token(&self, token_id: i64) -> Result<Option<TokenRecord>>;

    /// Overwrite every mutable field of the token with the given id
    async fn update_token(&self, token: &TokenRecord) -> Result<()>;

    /// Permanently mark a token as not refreshable
    async fn disable_refresh(&self, token_id: i64) -> Result<()>;

    /// Highest assigned token id, 0 when the table is empty
    async fn max_token_id(&self) -> Result<i64>;

    /// Refreshable tokens with `start_id <= id <= end_id` expiring before `deadline` (epoch millis)
    async fn find_expiring_tokens(
        &self,
        start_id: i64,
        end_id: i64,
        deadline: i64,
    ) -> Result<Vec<TokenRecord>>;
}

/// Trait for storing and retrieving provider connections
#[async_trait]
pub trait ConnectionStore: Send + Sync {
    /// Insert a connection, allocating `max(rank) + 1` for the (user, provider) pair.
    /// Returns the stored connection with its rank.
    async fn add_connection(&self, connection: &Connection) -> Result<Connection>;

    /// Insert the token and a connection referencing it in one transaction.
    /// A failed connection insert rolls the token back and is reported as
    /// [`StorageError::BindingRolledBack`].
    async fn insert_token_and_connection(
        &self,
        token: &TokenRecord,
        connection: &Connection,
    ) -> Result<Connection>;

    /// Full update keyed by (user_id, provider_id, provider_user_id)
    async fn update_connection(&self, connection: &Connection) -> Result<()>;

    /// Copy a refreshed token's fields into every connection referencing it
    async fn update_connection_by_token_id(&self, token: &TokenRecord) -> Result<()>;

    /// Connections bound to an external account
    async fn find_connections_by_provider_user(
        &self,
        provider_id: &str,
        provider_user_id: &str,
    ) -> Result<Vec<Connection>>;

    /// Connections of a local user, ordered by provider then rank
    async fn find_connections_by_user(
        &self,
        user_id: &str,
        provider_id: Option<&str>,
    ) -> Result<Vec<Connection>>;

    /// Update the token and its connections in one transaction
    async fn persist_refreshed_token(&self, token: &TokenRecord) -> Result<()>;
}

/// Local account collaborator used during identity resolution
#[async_trait]
pub trait LocalIdentityService: Send + Sync {
    /// Identity bound to an external account, if any
    async fn find_by_external_id(
        &self,
        provider_id: &str,
        provider_user_id: &str,
    ) -> Result<Option<LocalIdentity>>;

    /// Identity by local user id
    async fn find_by_user_id(&self, user_id: &str) -> Result<Option<LocalIdentity>>;

    /// Create a local account for an external profile
    async fn register_from_external(
        &self,
        profile: &ExternalProfile,
        username: &str,
        authorities: &[String],
    ) -> Result<LocalIdentity>;

    /// Register a local account and bind the profile's token and connection to it,
    /// all or nothing. A taken username is [`StorageError::Conflict`]; the
    /// connection's `user_id` is replaced by the new account's.
    async fn register_and_bind(
        &self,
        profile: &ExternalProfile,
        username: &str,
        authorities: &[String],
        token: &TokenRecord,
        connection: &Connection,
    ) -> Result<(LocalIdentity, Connection)>;

    /// For each candidate, whether the username is already taken
    async fn username_exists(&self, candidates: &[String]) -> Result<Vec<bool>>;
}

/// Combined storage trait
pub trait ConnectStorage: TokenStore + ConnectionStore + LocalIdentityService + Send + Sync {}

impl<T> ConnectStorage for T where T: TokenStore + ConnectionStore + LocalIdentityService + Send + Sync
{}
