//! SQLite storage implementations
//!
//! SQLite is suitable for single-instance deployments and development.

mod connections;
mod identities;
mod tokens;

use crate::errors::StorageError;
use crate::provider::ExternalProfile;
use crate::storage::traits::*;
use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use std::sync::Arc;

pub use connections::SqliteConnectionStore;
pub use identities::SqliteIdentityStore;
pub use tokens::SqliteTokenStore;

/// Comprehensive SQLite connect storage implementation
pub struct SqliteConnectStorage {
    pool: SqlitePool,
    token_store: Arc<SqliteTokenStore>,
    connection_store: Arc<SqliteConnectionStore>,
    identity_store: Arc<SqliteIdentityStore>,
}

impl SqliteConnectStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            token_store: Arc::new(SqliteTokenStore::new(pool.clone())),
            connection_store: Arc::new(SqliteConnectionStore::new(pool.clone())),
            identity_store: Arc::new(SqliteIdentityStore::new(pool.clone())),
            pool,
        }
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations/sqlite")
            .run(&self.pool)
            .await
            .map_err(|e| StorageError::DatabaseError(format!("Migration failed: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl TokenStore for SqliteConnectStorage {
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
impl ConnectionStore for SqliteConnectStorage {
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
impl LocalIdentityService for SqliteConnectStorage {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderToken;
    use chrono::{SubsecRound, Utc};
    use sqlx::sqlite::SqlitePoolOptions;

    // One connection keeps the in-memory database alive and shared
    async fn setup_storage() -> SqliteConnectStorage {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let storage = SqliteConnectStorage::new(pool);
        storage.migrate().await.unwrap();
        storage
    }

    fn token(expire_time: i64) -> TokenRecord {
        TokenRecord {
            id: 0,
            provider_id: "gitee".to_string(),
            access_token: "at".to_string(),
            refresh_token: Some("rt".to_string()),
            token_type: Some("bearer".to_string()),
            scope: Some("user_info".to_string()),
            expire_time,
            enable_refresh: true,
            updated_at: Utc::now().trunc_subsecs(0),
        }
    }

    fn profile(provider_user_id: &str) -> ExternalProfile {
        ExternalProfile {
            provider_id: "gitee".to_string(),
            provider_user_id: provider_user_id.to_string(),
            username: format!("user{provider_user_id}"),
            nickname: None,
            avatar: Some("https://gitee.com/avatar.png".to_string()),
            profile_url: None,
            email: None,
            raw: serde_json::Value::Null,
            token: ProviderToken {
                access_token: "at".to_string(),
                refresh_token: None,
                expires_in: None,
                token_type: None,
                scope: None,
            },
        }
    }

    #[tokio::test]
    async fn test_token_round_trip_and_expiry_query() {
        let storage = setup_storage().await;
        assert_eq!(storage.max_token_id().await.unwrap(), 0);

        let stale = storage.insert_token(&token(1_000)).await.unwrap();
        let never = storage.insert_token(&token(NEVER_EXPIRES)).await.unwrap();
        assert_eq!(storage.max_token_id().await.unwrap(), never);

        let stored = storage.get_token(stale).await.unwrap().unwrap();
        assert_eq!(stored, TokenRecord { id: stale, ..token(1_000) });

        let found = storage.find_expiring_tokens(1, 10, 5_000).await.unwrap();
        assert_eq!(found.iter().map(|t| t.id).collect::<Vec<_>>(), vec![stale]);

        storage.disable_refresh(stale).await.unwrap();
        assert!(storage.find_expiring_tokens(1, 10, 5_000).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rank_allocation_and_refresh_propagation() {
        let storage = setup_storage().await;
        let mut record = token(1_000);
        record.id = storage.insert_token(&record).await.unwrap();

        for (i, provider_user_id) in ["a", "b", "c"].iter().enumerate() {
            let connection = Connection::from_profile("u1", &profile(provider_user_id), &record);
            let stored = storage.add_connection(&connection).await.unwrap();
            assert_eq!(stored.rank, i as i32 + 1);
        }

        let duplicate = Connection::from_profile("u1", &profile("a"), &record);
        assert!(matches!(
            storage.add_connection(&duplicate).await,
            Err(StorageError::Conflict(_))
        ));

        record.access_token = "at2".to_string();
        record.expire_time = 9_000;
        storage.persist_refreshed_token(&record).await.unwrap();

        let connections = storage.find_connections_by_user("u1", Some("gitee")).await.unwrap();
        assert_eq!(connections.len(), 3);
        assert!(connections.iter().all(|c| c.access_token == "at2" && c.expire_time == 9_000));
        assert!(storage.find_connections_by_user("u1", Some("github")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_identity_registration() {
        let storage = setup_storage().await;
        let profile = profile("7");
        let authorities = vec!["ROLE_USER".to_string(), "ROLE_EXTRA".to_string()];
        let identity = storage
            .register_from_external(&profile, "user7", &authorities)
            .await
            .unwrap();

        let loaded = storage.find_by_user_id(&identity.user_id).await.unwrap().unwrap();
        assert_eq!(loaded.authorities, authorities);
        assert_eq!(loaded.avatar, profile.avatar);

        assert_eq!(
            storage
                .username_exists(&["user7".to_string(), "user7_gitee".to_string()])
                .await
                .unwrap(),
            vec![true, false]
        );
        assert!(matches!(
            storage.register_from_external(&profile, "user7", &[]).await,
            Err(StorageError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_binding_rolls_back_token_on_connection_failure() {
        let storage = setup_storage().await;
        let record = token(1_000);
        let first = profile("b1");
        let connection = Connection::from_profile("", &first, &record);

        let (identity, stored) = storage
            .register_and_bind(&first, "userb1", &[], &record, &connection)
            .await
            .unwrap();
        assert_eq!(stored.rank, 1);
        assert_eq!(stored.token_id, Some(storage.max_token_id().await.unwrap()));

        let duplicate = Connection::from_profile(&identity.user_id, &first, &record);
        let before = storage.max_token_id().await.unwrap();
        assert!(matches!(
            storage.insert_token_and_connection(&record, &duplicate).await,
            Err(StorageError::BindingRolledBack { .. })
        ));
        assert_eq!(storage.max_token_id().await.unwrap(), before);

        assert!(matches!(
            storage
                .register_and_bind(&profile("b2"), "userb1", &[], &record, &duplicate)
                .await,
            Err(StorageError::Conflict(_))
        ));
        assert_eq!(storage.max_token_id().await.unwrap(), before);
    }
}
