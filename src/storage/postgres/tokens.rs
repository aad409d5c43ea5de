//! PostgreSQL implementation for provider token storage

use crate::errors::StorageError;
use crate::storage::traits::{Result, TokenRecord, TokenStore};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;
use sqlx::postgres::{PgConnection, PgPool, PgRow};

/// PostgreSQL implementation of token storage
pub struct PostgresTokenStore {
    pool: PgPool,
}

impl PostgresTokenStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Convert PostgreSQL row to TokenRecord
    pub(super) fn row_to_token(row: &PgRow) -> Result<TokenRecord> {
        Ok(TokenRecord {
            id: row
                .try_get("id")
                .map_err(|e| StorageError::DatabaseError(format!("Failed to get id: {}", e)))?,
            provider_id: row.try_get("provider_id").map_err(|e| {
                StorageError::DatabaseError(format!("Failed to get provider_id: {}", e))
            })?,
            access_token: row.try_get("access_token").map_err(|e| {
                StorageError::DatabaseError(format!("Failed to get access_token: {}", e))
            })?,
            refresh_token: row.try_get("refresh_token").map_err(|e| {
                StorageError::DatabaseError(format!("Failed to get refresh_token: {}", e))
            })?,
            token_type: row.try_get("token_type").map_err(|e| {
                StorageError::DatabaseError(format!("Failed to get token_type: {}", e))
            })?,
            scope: row
                .try_get("scope")
                .map_err(|e| StorageError::DatabaseError(format!("Failed to get scope: {}", e)))?,
            expire_time: row.try_get("expire_time").map_err(|e| {
                StorageError::DatabaseError(format!("Failed to get expire_time: {}", e))
            })?,
            enable_refresh: row.try_get("enable_refresh").map_err(|e| {
                StorageError::DatabaseError(format!("Failed to get enable_refresh: {}", e))
            })?,
            updated_at: row.try_get("updated_at").map_err(|e| {
                StorageError::DatabaseError(format!("Failed to get updated_at: {}", e))
            })?,
        })
    }
}

/// Insert a token row on an open connection or transaction and return its id
pub(super) async fn insert_token_row(conn: &mut PgConnection, token: &TokenRecord) -> Result<i64> {
    let row = sqlx::query(
        r#"
        INSERT INTO auth_tokens (
            provider_id, access_token, refresh_token, token_type, scope,
            expire_time, enable_refresh, updated_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING id
        "#,
    )
    .bind(&token.provider_id)
    .bind(&token.access_token)
    .bind(&token.refresh_token)
    .bind(&token.token_type)
    .bind(&token.scope)
    .bind(token.expire_time)
    .bind(token.enable_refresh)
    .bind(token.updated_at)
    .fetch_one(conn)
    .await
    .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

    row.try_get("id")
        .map_err(|e| StorageError::DatabaseError(format!("Failed to get id: {}", e)))
}

#[async_trait]
impl TokenStore for PostgresTokenStore {
    async fn insert_token(&self, token: &TokenRecord) -> Result<i64> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;
        insert_token_row(&mut conn, token).await
    }

    async fn get_token(&self, token_id: i64) -> Result<Option<TokenRecord>> {
        let row = sqlx::query("SELECT * FROM auth_tokens WHERE id = $1")
            .bind(token_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        row.as_ref().map(Self::row_to_token).transpose()
    }

    async fn update_token(&self, token: &TokenRecord) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE auth_tokens SET
                access_token = $2, refresh_token = $3, token_type = $4, scope = $5,
                expire_time = $6, enable_refresh = $7, updated_at = $8
            WHERE id = $1
            "#,
        )
        .bind(token.id)
        .bind(&token.access_token)
        .bind(&token.refresh_token)
        .bind(&token.token_type)
        .bind(&token.scope)
        .bind(token.expire_time)
        .bind(token.enable_refresh)
        .bind(token.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("token {}", token.id)));
        }
        Ok(())
    }

    async fn disable_refresh(&self, token_id: i64) -> Result<()> {
        sqlx::query("UPDATE auth_tokens SET enable_refresh = FALSE, updated_at = $2 WHERE id = $1")
            .bind(token_id)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::DatabaseError(e.to_string()))?;
        Ok(())
    }

    async fn max_token_id(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COALESCE(MAX(id), 0) AS max_id FROM auth_tokens")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        row.try_get("max_id")
            .map_err(|e| StorageError::DatabaseError(format!("Failed to get max_id: {}", e)))
    }

    async fn find_expiring_tokens(
        &self,
        start_id: i64,
        end_id: i64,
        deadline: i64,
    ) -> Result<Vec<TokenRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM auth_tokens
            WHERE id BETWEEN $1 AND $2
              AND enable_refresh = TRUE
              AND expire_time <> -1
              AND expire_time < $3
            ORDER BY id
            "#,
        )
        .bind(start_id)
        .bind(end_id)
        .bind(deadline)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        rows.iter().map(Self::row_to_token).collect()
    }
}
