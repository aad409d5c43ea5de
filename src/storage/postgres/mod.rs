//! PostgreSQL storage implementations
//!
//! Suitable for multi-node production deployments.

mod connections;
mod identities;
mod tokens;

use crate::errors::StorageError;
use crate::provider::ExternalProfile;
use crate::storage::traits::*;
use async_trait::async_trait;
use sqlx::postgres::PgPool;
use std::sync::Arc;

pub use connections::PostgresConnectionStore;
pub use identities::PostgresIdentityStore;
pub use tokens::PostgresTokenStore;

/// Comprehensive PostgreSQL connect storage implementation
pub struct PostgresConnectStorage {
    pool: PgPool,
    token_store: Arc<PostgresTokenStore>,
    connection_store: Arc<PostgresConnectionStore>,
    identity_store: Arc<PostgresIdentityStore>,
}

impl PostgresConnectStorage {
    pub fn new(pool: PgPool) -> Self {
        Self {
            token_store: Arc::new(PostgresTokenStore::new(pool.clone())),
            connection_store: Arc::new(PostgresConnectionStore::new(pool.clone())),
            identity_store: Arc::new(PostgresIdentityStore::new(pool.clone())),
            pool,
        }
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations/postgres")
            .run(&self.pool)
            .await
            .map_err(|e| StorageError::DatabaseError(format!("Migration failed: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl TokenStore for PostgresConnectStorage {
    async fn insert_token(&self, token: &TokenRecord) -> Result<i64> {
        self.token_store.insert_token(token).await
    }

    async fn get_token(&self, token_id: i64) -> Result<Option<TokenRecord>> {
        self.token_store.get_token(token_id).await
    }

    async fn update_token(&self, token: &TokenRecord) -> Result<()> {
        self.token_store.update_token(token).await
    }

    async fn disable_refresh(&self, token_id: i64) -> Result<()> {
        self.token_store.disable_refresh(token_id).await
    }

    async fn max_token_id(&self) -> Result<i64> {
        self.token_store.max_token_id().await
    }

    async fn find_expiring_tokens(
        &self,
        start_id: i64,
        end_id: i64,
        deadline: i64,
    ) -> Result<Vec<TokenRecord>> {
        self.token_store
            .find_expiring_tokens(start_id, end_id, deadline)
            .await
    }
}

#[async_trait]
impl ConnectionStore for PostgresConnectStorage {
    async fn add_connection(&self, connection: &Connection) -> Result<Connection> {
        self.connection_store.add_connection(connection).await
    }

    async fn insert_token_and_connection(
        &self,
        token: &TokenRecord,
        connection: &Connection,
    ) -> Result<Connection> {
        self.connection_store
            .insert_token_and_connection(token, connection)
            .await
    }

    async fn update_connection(&self, connection: &Connection) -> Result<()> {
        self.connection_store.update_connection(connection).await
    }

    async fn update_connection_by_token_id(&self, token: &TokenRecord) -> Result<()> {
        self.connection_store
            .update_connection_by_token_id(token)
            .await
    }

    async fn find_connections_by_provider_user(
        &self,
        provider_id: &str,
        provider_user_id: &str,
    ) -> Result<Vec<Connection>> {
        self.connection_store
            .find_connections_by_provider_user(provider_id, provider_user_id)
            .await
    }

    async fn find_connections_by_user(
        &self,
        user_id: &str,
        provider_id: Option<&str>,
    ) -> Result<Vec<Connection>> {
        self.connection_store
            .find_connections_by_user(user_id, provider_id)
            .await
    }

    async fn persist_refreshed_token(&self, token: &TokenRecord) -> Result<()> {
        self.connection_store.persist_refreshed_token(token).await
    }
}

#[async_trait]
impl LocalIdentityService for PostgresConnectStorage {
    async fn find_by_external_id(
        &self,
        provider_id: &str,
        provider_user_id: &str,
    ) -> Result<Option<LocalIdentity>> {
        self.identity_store
            .find_by_external_id(provider_id, provider_user_id)
            .await
    }

    async fn find_by_user_id(&self, user_id: &str) -> Result<Option<LocalIdentity>> {
        self.identity_store.find_by_user_id(user_id).await
    }

    async fn register_from_external(
        &self,
        profile: &ExternalProfile,
        username: &str,
        authorities: &[String],
    ) -> Result<LocalIdentity> {
        self.identity_store
            .register_from_external(profile, username, authorities)
            .await
    }

    async fn register_and_bind(
        &self,
        profile: &ExternalProfile,
        username: &str,
        authorities: &[String],
        token: &TokenRecord,
        connection: &Connection,
    ) -> Result<(LocalIdentity, Connection)> {
        self.identity_store
            .register_and_bind(profile, username, authorities, token, connection)
            .await
    }

    async fn username_exists(&self, candidates: &[String]) -> Result<Vec<bool>> {
        self.identity_store.username_exists(candidates).await
    }
}
