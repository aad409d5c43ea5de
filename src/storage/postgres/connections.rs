//! PostgreSQL implementation for connection storage
//!
//! Rank allocation takes a transaction-scoped advisory lock on the
//! (user, provider) pair before reading `MAX(rank)`, so concurrent binders
//! queue instead of colliding on the unique rank constraint.

use crate::errors::StorageError;
use crate::storage::sql_write_error;
use crate::storage::traits::{Connection, ConnectionStore, Result, TokenRecord};
use async_trait::async_trait;
use sqlx::Row;
use sqlx::postgres::{PgConnection, PgPool, PgRow};

use super::tokens::insert_token_row;

/// PostgreSQL implementation of connection storage
pub struct PostgresConnectionStore {
    pool: PgPool,
}

impl PostgresConnectionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_connection(row: &PgRow) -> Result<Connection> {
        Ok(Connection {
            user_id: row.try_get("user_id").map_err(|e| {
                StorageError::DatabaseError(format!("Failed to get user_id: {}", e))
            })?,
            provider_id: row.try_get("provider_id").map_err(|e| {
                StorageError::DatabaseError(format!("Failed to get provider_id: {}", e))
            })?,
            provider_user_id: row.try_get("provider_user_id").map_err(|e| {
                StorageError::DatabaseError(format!("Failed to get provider_user_id: {}", e))
            })?,
            rank: row
                .try_get("rank")
                .map_err(|e| StorageError::DatabaseError(format!("Failed to get rank: {}", e)))?,
            display_name: row.try_get("display_name").map_err(|e| {
                StorageError::DatabaseError(format!("Failed to get display_name: {}", e))
            })?,
            profile_url: row.try_get("profile_url").map_err(|e| {
                StorageError::DatabaseError(format!("Failed to get profile_url: {}", e))
            })?,
            image_url: row.try_get("image_url").map_err(|e| {
                StorageError::DatabaseError(format!("Failed to get image_url: {}", e))
            })?,
            access_token: row.try_get("access_token").map_err(|e| {
                StorageError::DatabaseError(format!("Failed to get access_token: {}", e))
            })?,
            refresh_token: row.try_get("refresh_token").map_err(|e| {
                StorageError::DatabaseError(format!("Failed to get refresh_token: {}", e))
            })?,
            expire_time: row.try_get("expire_time").map_err(|e| {
                StorageError::DatabaseError(format!("Failed to get expire_time: {}", e))
            })?,
            token_id: row.try_get("token_id").map_err(|e| {
                StorageError::DatabaseError(format!("Failed to get token_id: {}", e))
            })?,
        })
    }
}

/// Insert a connection with rank `max + 1` for its (user, provider).
/// Must run inside a transaction; the advisory lock is released on commit or rollback.
pub(super) async fn insert_connection_row(
    conn: &mut PgConnection,
    connection: &Connection,
) -> Result<Connection> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(format!("{}:{}", connection.user_id, connection.provider_id))
        .execute(&mut *conn)
        .await
        .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

    let row = sqlx::query(
        r#"
        INSERT INTO user_connections (
            user_id, provider_id, provider_user_id, rank, display_name, profile_url,
            image_url, access_token, refresh_token, expire_time, token_id
        )
        SELECT $1, $2, $3, COALESCE(MAX(rank), 0) + 1, $4, $5, $6, $7, $8, $9, $10
        FROM user_connections
        WHERE user_id = $1 AND provider_id = $2
        RETURNING rank
        "#,
    )
    .bind(&connection.user_id)
    .bind(&connection.provider_id)
    .bind(&connection.provider_user_id)
    .bind(&connection.display_name)
    .bind(&connection.profile_url)
    .bind(&connection.image_url)
    .bind(&connection.access_token)
    .bind(&connection.refresh_token)
    .bind(connection.expire_time)
    .bind(connection.token_id)
    .fetch_one(&mut *conn)
    .await
    .map_err(sql_write_error)?;

    let rank: i32 = row
        .try_get("rank")
        .map_err(|e| StorageError::DatabaseError(format!("Failed to get rank: {}", e)))?;

    Ok(Connection {
        rank,
        ..connection.clone()
    })
}

/// Insert the token, then a connection referencing it. The caller's
/// transaction is rolled back on error.
pub(super) async fn insert_binding_rows(
    conn: &mut PgConnection,
    token: &TokenRecord,
    connection: &Connection,
) -> Result<Connection> {
    let token_id = insert_token_row(&mut *conn, token).await?;
    let connection = Connection {
        token_id: Some(token_id),
        ..connection.clone()
    };
    insert_connection_row(conn, &connection)
        .await
        .map_err(|e| StorageError::BindingRolledBack {
            token_id,
            message: e.to_string(),
        })
}

#[async_trait]
impl ConnectionStore for PostgresConnectionStore {
    async fn add_connection(&self, connection: &Connection) -> Result<Connection> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        let stored = insert_connection_row(&mut tx, connection).await?;

        tx.commit()
            .await
            .map_err(|e| StorageError::DatabaseError(e.to_string()))?;
        Ok(stored)
    }

    async fn insert_token_and_connection(
        &self,
        token: &TokenRecord,
        connection: &Connection,
    ) -> Result<Connection> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        let stored = insert_binding_rows(&mut tx, token, connection).await?;

        tx.commit()
            .await
            .map_err(|e| StorageError::DatabaseError(e.to_string()))?;
        Ok(stored)
    }

    async fn update_connection(&self, connection: &Connection) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE user_connections SET
                display_name = $4, profile_url = $5, image_url = $6, access_token = $7,
                refresh_token = $8, expire_time = $9, token_id = $10
            WHERE user_id = $1 AND provider_id = $2 AND provider_user_id = $3
            "#,
        )
        .bind(&connection.user_id)
        .bind(&connection.provider_id)
        .bind(&connection.provider_user_id)
        .bind(&connection.display_name)
        .bind(&connection.profile_url)
        .bind(&connection.image_url)
        .bind(&connection.access_token)
        .bind(&connection.refresh_token)
        .bind(connection.expire_time)
        .bind(connection.token_id)
        .execute(&self.pool)
        .await
        .map_err(sql_write_error)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!(
                "connection {}/{} for user {}",
                connection.provider_id, connection.provider_user_id, connection.user_id
            )));
        }
        Ok(())
    }

    async fn update_connection_by_token_id(&self, token: &TokenRecord) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE user_connections SET access_token = $2, refresh_token = $3, expire_time = $4
            WHERE token_id = $1
            "#,
        )
        .bind(token.id)
        .bind(&token.access_token)
        .bind(&token.refresh_token)
        .bind(token.expire_time)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::DatabaseError(e.to_string()))?;
        Ok(())
    }

    async fn find_connections_by_provider_user(
        &self,
        provider_id: &str,
        provider_user_id: &str,
    ) -> Result<Vec<Connection>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM user_connections
            WHERE provider_id = $1 AND provider_user_id = $2
            ORDER BY user_id, rank
            "#,
        )
        .bind(provider_id)
        .bind(provider_user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        rows.iter().map(Self::row_to_connection).collect()
    }

    async fn find_connections_by_user(
        &self,
        user_id: &str,
        provider_id: Option<&str>,
    ) -> Result<Vec<Connection>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM user_connections
            WHERE user_id = $1 AND ($2::TEXT IS NULL OR provider_id = $2)
            ORDER BY provider_id, rank
            "#,
        )
        .bind(user_id)
        .bind(provider_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        rows.iter().map(Self::row_to_connection).collect()
    }

    async fn persist_refreshed_token(&self, token: &TokenRecord) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

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
        .execute(&mut *tx)
        .await
        .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("token {}", token.id)));
        }

        sqlx::query(
            r#"
            UPDATE user_connections SET access_token = $2, refresh_token = $3, expire_time = $4
            WHERE token_id = $1
            "#,
        )
        .bind(token.id)
        .bind(&token.access_token)
        .bind(&token.refresh_token)
        .bind(token.expire_time)
        .execute(&mut *tx)
        .await
        .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StorageError::DatabaseError(e.to_string()))?;
        Ok(())
    }
}
