//! In-memory state cache and authorization context store
//!
//! Entries carry their own expiry and are evicted lazily when read, plus on
//! every write so abandoned flows do not accumulate.

use super::{AuthorizationContext, AuthorizationContextStore, Result, StateCache};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

struct Entry<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Entry<T> {
    fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Single-node state cache
#[derive(Default)]
pub struct MemoryStateCache {
    entries: RwLock<HashMap<String, Entry<String>>>,
}

impl MemoryStateCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateCache for MemoryStateCache {
    async fn cache(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        entries.retain(|_, entry| entry.is_live(now));
        entries.insert(key.to_string(), Entry::new(value.to_string(), ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                None => return Ok(None),
                Some(entry) if entry.is_live(now) => return Ok(Some(entry.value.clone())),
                Some(_) => {}
            }
        }

        // Expired: evict under the write lock, re-checking in case it was replaced
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|entry| !entry.is_live(now)) {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn contains_key(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// Single-node authorization context store
#[derive(Default)]
pub struct MemoryAuthorizationContextStore {
    contexts: RwLock<HashMap<String, Entry<AuthorizationContext>>>,
}

impl MemoryAuthorizationContextStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuthorizationContextStore for MemoryAuthorizationContextStore {
    async fn store(&self, context: &AuthorizationContext, ttl: Duration) -> Result<()> {
        let mut contexts = self.contexts.write().await;
        let now = Instant::now();
        contexts.retain(|_, entry| entry.is_live(now));
        contexts.insert(context.state.clone(), Entry::new(context.clone(), ttl));
        Ok(())
    }

    async fn pop(&self, state: &str) -> Result<Option<AuthorizationContext>> {
        let entry = self.contexts.write().await.remove(state);
        Ok(entry
            .filter(|entry| entry.is_live(Instant::now()))
            .map(|entry| entry.value))
    }
}
