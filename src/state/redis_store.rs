//! Redis-backed state cache and authorization context store shared across nodes

use super::{AuthorizationContext, AuthorizationContextStore, Result, StateCache};
use crate::errors::StorageError;
use async_trait::async_trait;
use deadpool_redis::{Config as PoolConfig, Connection, Pool, Runtime};
use redis::AsyncCommands;
use std::time::Duration;

/// Build a Tokio connection pool for `url`
pub fn create_redis_pool(url: &str) -> Result<Pool> {
    PoolConfig::from_url(url)
        .create_pool(Some(Runtime::Tokio1))
        .map_err(|e| StorageError::CacheUnavailable(format!("Failed to create Redis pool: {}", e)))
}

pub(crate) async fn pooled_connection(pool: &Pool) -> Result<Connection> {
    pool.get().await.map_err(|e| {
        StorageError::CacheUnavailable(format!("Failed to get connection from pool: {}", e))
    })
}

fn cache_error(e: redis::RedisError) -> StorageError {
    StorageError::CacheUnavailable(e.to_string())
}

// Redis rejects SET EX 0
fn ttl_seconds(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

fn build_key(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}:{}", prefix, key)
    }
}

#[derive(Clone)]
pub struct RedisStateCache {
    pool: Pool,
    key_prefix: String,
}

impl RedisStateCache {
    pub fn new(pool: Pool, key_prefix: impl Into<String>) -> Self {
        Self {
            pool,
            key_prefix: key_prefix.into(),
        }
    }
}

#[async_trait]
impl StateCache for RedisStateCache {
    async fn cache(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = pooled_connection(&self.pool).await?;
        let _: () = conn
            .set_ex(build_key(&self.key_prefix, key), value, ttl_seconds(ttl))
            .await
            .map_err(cache_error)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = pooled_connection(&self.pool).await?;
        let value: Option<String> = conn
            .get(build_key(&self.key_prefix, key))
            .await
            .map_err(cache_error)?;
        Ok(value)
    }

    async fn contains_key(&self, key: &str) -> Result<bool> {
        let mut conn = pooled_connection(&self.pool).await?;
        let exists: bool = conn
            .exists(build_key(&self.key_prefix, key))
            .await
            .map_err(cache_error)?;
        Ok(exists)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut conn = pooled_connection(&self.pool).await?;
        let _: () = conn
            .del(build_key(&self.key_prefix, key))
            .await
            .map_err(cache_error)?;
        Ok(())
    }
}

/// Contexts are stored as JSON and consumed with `GETDEL`
#[derive(Clone)]
pub struct RedisAuthorizationContextStore {
    pool: Pool,
    key_prefix: String,
}

impl RedisAuthorizationContextStore {
    pub fn new(pool: Pool, key_prefix: impl Into<String>) -> Self {
        Self {
            pool,
            key_prefix: key_prefix.into(),
        }
    }

    fn context_key(&self, state: &str) -> String {
        build_key(&self.key_prefix, &format!("context:{state}"))
    }
}

#[async_trait]
impl AuthorizationContextStore for RedisAuthorizationContextStore {
    async fn store(&self, context: &AuthorizationContext, ttl: Duration) -> Result<()> {
        let serialized = serde_json::to_string(context)
            .map_err(|e| StorageError::SerializationFailed(e.to_string()))?;
        let mut conn = pooled_connection(&self.pool).await?;
        let _: () = conn
            .set_ex(self.context_key(&context.state), serialized, ttl_seconds(ttl))
            .await
            .map_err(cache_error)?;
        Ok(())
    }

    async fn pop(&self, state: &str) -> Result<Option<AuthorizationContext>> {
        let mut conn = pooled_connection(&self.pool).await?;
        let value: Option<String> = redis::cmd("GETDEL")
            .arg(self.context_key(state))
            .query_async(&mut conn)
            .await
            .map_err(cache_error)?;

        value
            .map(|json| {
                serde_json::from_str(&json)
                    .map_err(|e| StorageError::SerializationFailed(e.to_string()))
            })
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_key() {
        assert_eq!(build_key("", "state:a"), "state:a");
        assert_eq!(build_key("connect", "state:a"), "connect:state:a");
    }

    #[test]
    fn test_ttl_seconds_floor() {
        assert_eq!(ttl_seconds(Duration::from_millis(10)), 1);
        assert_eq!(ttl_seconds(Duration::from_secs(180)), 180);
    }
}
