//! Short-lived anti-CSRF state and in-flight authorization context.
//!
//! Both stores have an in-memory implementation for single-node deployments
//! and a Redis implementation shared across nodes.

pub mod coder;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_store;

pub use coder::{DecodedState, RedirectStateCoder, StateCoder};
pub use memory::{MemoryAuthorizationContextStore, MemoryStateCache};
#[cfg(feature = "redis")]
pub use redis_store::{RedisAuthorizationContextStore, RedisStateCache, create_redis_pool};

use crate::errors::StorageError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::{Rng, distributions::Alphanumeric};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, StorageError>;

const STATE_LENGTH: usize = 32;

/// Random URL-safe state token
pub fn generate_state() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(STATE_LENGTH)
        .map(char::from)
        .collect()
}

/// Expiring key/value store for state tokens
#[async_trait]
pub trait StateCache: Send + Sync {
    /// Store `value` under `key` for `ttl`, replacing any previous entry
    async fn cache(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Value for `key`, or `None` once expired
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn contains_key(&self, key: &str) -> Result<bool>;

    async fn remove(&self, key: &str) -> Result<()>;
}

/// How state cache keys are derived
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKeyStrategy {
    /// The state itself is the key; every flow is isolated
    Random,
    /// The provider id is the key; a newer flow for the same provider replaces the older one
    PerProvider,
}

impl StateKeyStrategy {
    pub fn key(&self, provider_id: &str, state: &str) -> String {
        match self {
            Self::Random => format!("state:{state}"),
            Self::PerProvider => format!("state:provider:{provider_id}"),
        }
    }
}

impl FromStr for StateKeyStrategy {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "random" | "uuid" => Ok(Self::Random),
            "provider" | "fixed" => Ok(Self::PerProvider),
            other => Err(other.to_string()),
        }
    }
}

/// Authorization request held between redirect and callback
#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(any(debug_assertions, test), derive(Debug))]
pub struct AuthorizationContext {
    pub provider_id: String,
    /// State as sent to the provider (after encoding)
    pub state: String,
    pub created_at: DateTime<Utc>,
    /// Extra query parameters supplied by the caller
    pub params: HashMap<String, String>,
}

/// Store for in-flight authorization contexts, keyed by the encoded state
#[async_trait]
pub trait AuthorizationContextStore: Send + Sync {
    async fn store(&self, context: &AuthorizationContext, ttl: Duration) -> Result<()>;

    /// Remove and return the context; `None` if absent or expired
    async fn pop(&self, state: &str) -> Result<Option<AuthorizationContext>>;
}
