//! Standardized error types following the `error-connect-<domain>-<number>` format.

use axum::{
    Json,
    response::{IntoResponse, Response},
};
use http::StatusCode;
use serde_json::json;
use thiserror::Error;

/// Configuration errors that occur during application startup
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error when a required environment variable is not set
    #[error("error-connect-config-1 {0} must be set")]
    EnvVarRequired(String),

    /// Error when PORT cannot be parsed
    #[error("error-connect-config-2 Parsing PORT into u16 failed: {0:?}")]
    PortParsingFailed(std::num::ParseIntError),

    /// Error when version information is not available
    #[error("error-connect-config-3 One of GIT_HASH or CARGO_PKG_VERSION must be set")]
    VersionNotSet,

    /// Error when a numeric setting cannot be parsed
    #[error("error-connect-config-4 Failed to parse number '{0}': {1}")]
    NumberParsingFailed(String, std::num::ParseIntError),

    /// Error when a numeric setting is out of range
    #[error("error-connect-config-5 {0} must be greater than zero")]
    MustBePositive(String),

    /// Error when duration string cannot be parsed
    #[error("error-connect-config-6 Failed to parse duration '{0}': {1}")]
    DurationParsingFailed(String, String),

    /// Error when boolean string cannot be parsed
    #[error(
        "error-connect-config-7 Failed to parse boolean '{0}': expected true/false/1/0/yes/no/on/off"
    )]
    BoolParsingFailed(String),

    /// Error when the state key strategy is not recognized
    #[error("error-connect-config-8 Unknown state key strategy '{0}': expected random or provider")]
    UnknownStateStrategy(String),

    /// Error when a provider kind is not recognized
    #[error("error-connect-config-9 Unknown provider kind '{kind}' for provider '{provider_id}'")]
    UnknownProviderKind { provider_id: String, kind: String },

    /// Error when a provider endpoint is missing or invalid
    #[error("error-connect-config-10 Invalid endpoint for provider '{0}': {1}")]
    InvalidProviderEndpoint(String, String),

    /// Error when the refresh cron expression cannot be parsed
    #[error("error-connect-config-11 Invalid cron expression '{0}': {1}")]
    InvalidCronExpression(String, String),

    /// Error when the provider HTTP client cannot be built
    #[error("error-connect-config-12 Failed to build HTTP client for provider '{0}': {1}")]
    HttpClientBuildFailed(String, String),
}

/// Errors surfaced to the interactive caller during the authorization round trip
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Unknown or misconfigured provider
    #[error("error-connect-flow-1 Provider not configured: {0}")]
    Configuration(String),

    /// Missing, expired or mismatched state, or a replayed callback
    #[error("error-connect-flow-2 Invalid authorization state: {0}")]
    CsrfState(String),

    /// The provider reported an error or returned a malformed response
    #[error("error-connect-flow-3 Provider protocol failure: {0}")]
    ProviderProtocol(String),

    /// Every candidate username for auto sign-up is already taken
    #[error("error-connect-flow-4 No available username for '{0}'")]
    UsernameExhausted(String),

    /// A storage write failed after a successful token exchange. `orphaned_token_id`
    /// names the token the failed binding wrote and rolled back.
    #[error("error-connect-flow-5 Persistence failed (orphaned token: {orphaned_token_id:?}): {message}")]
    Persistence {
        message: String,
        orphaned_token_id: Option<i64>,
    },
}

impl ConnectError {
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence {
            message: message.into(),
            orphaned_token_id: None,
        }
    }

    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            Self::Configuration(_) => (StatusCode::NOT_FOUND, "unknown_provider"),
            Self::CsrfState(_) => (StatusCode::BAD_REQUEST, "invalid_state"),
            Self::ProviderProtocol(_) => (StatusCode::BAD_GATEWAY, "provider_error"),
            Self::UsernameExhausted(_) => (StatusCode::CONFLICT, "username_unavailable"),
            Self::Persistence { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "server_error"),
        }
    }
}

impl From<StorageError> for ConnectError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::BindingRolledBack { token_id, .. } => Self::Persistence {
                message: err.to_string(),
                orphaned_token_id: Some(token_id),
            },
            other => Self::persistence(other.to_string()),
        }
    }
}

impl IntoResponse for ConnectError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let description = match &self {
            Self::Persistence { .. } => {
                tracing::error!(error = ?self, "internal server error");
                "Failed to complete sign in".to_string()
            }
            other => {
                tracing::warn!(error = ?other, "authorization flow rejected");
                other.to_string()
            }
        };
        let body = json!({
            "error": code,
            "error_description": description,
        });
        (status, Json(body)).into_response()
    }
}

/// Errors raised while refreshing stored provider tokens
#[derive(Debug, Error)]
pub enum RefreshError {
    /// The provider does not support refreshing this token
    #[error("error-connect-refresh-1 Refresh not supported by provider '{0}'")]
    Unsupported(String),

    /// Network, 5xx or storage failure; retried on the next cycle
    #[error("error-connect-refresh-2 Transient refresh failure: {0}")]
    Transient(String),

    /// The shared cache backing the batch lock is unreachable
    #[error("error-connect-refresh-3 Batch lock unavailable: {0}")]
    LockUnavailable(String),
}

/// Database/storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    /// Error when database connection fails
    #[error("error-connect-storage-1 Database connection failed: {0}")]
    ConnectionFailed(String),

    /// Error when query execution fails
    #[error("error-connect-storage-2 Query execution failed: {0}")]
    QueryFailed(String),

    /// Error when data serialization fails
    #[error("error-connect-storage-3 Data serialization failed: {0}")]
    SerializationFailed(String),

    /// Error when database operation fails
    #[error("error-connect-storage-4 Database error: {0}")]
    DatabaseError(String),

    /// Error when data validation fails
    #[error("error-connect-storage-5 Invalid data: {0}")]
    InvalidData(String),

    /// Error when a unique constraint rejects the write
    #[error("error-connect-storage-6 Conflict: {0}")]
    Conflict(String),

    /// Error when requested resource is not found
    #[error("error-connect-storage-7 Not found: {0}")]
    NotFound(String),

    /// Error when token encryption or decryption fails
    #[error("error-connect-storage-8 Token cipher failure: {0}")]
    CipherFailed(String),

    /// Error when the shared cache cannot be reached
    #[error("error-connect-storage-9 Cache unavailable: {0}")]
    CacheUnavailable(String),

    /// Error when the connection insert of a binding failed and its token was rolled back
    #[error("error-connect-storage-10 Connection write failed, token {token_id} rolled back: {message}")]
    BindingRolledBack { token_id: i64, message: String },
}
