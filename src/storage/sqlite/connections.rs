//! SQLite implementation for connection storage

use crate::errors::StorageError;
use crate::storage::sql_write_error;
use crate::storage::traits::{Connection, ConnectionStore, Result, TokenRecord};
use async_trait::async_trait;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqliteRow};

use super::tokens::insert_token_row;

/// SQLite implementation of connection storage
pub struct SqliteConnectionStore {
    pool: SqlitePool,
}

impl SqliteConnectionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_connection(row: &SqliteRow) -> Result<Connection> {
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
/// Must run inside a transaction.
pub(super) async fn insert_connection_row(
    conn: &mut SqliteConnection,
    connection: &Connection,
) -> Result<Connection> {
    // A single INSERT ... SELECT holds the database write lock for the
    // whole read-max-then-insert sequence
    sqlx::query(
        r#"
        INSERT INTO user_connections (
            user_id, provider_id, provider_user_id, rank, display_name, profile_url,
            image_url, access_token, refresh_token, expire_time, token_id
        )
        SELECT ?, ?, ?, COALESCE(MAX(rank), 0) + 1, ?, ?, ?, ?, ?, ?, ?
        FROM user_connections
        WHERE user_id = ? AND provider_id = ?
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
    .bind(&connection.user_id)
    .bind(&connection.provider_id)
    .execute(&mut *conn)
    .await
    .map_err(sql_write_error)?;

    let row = sqlx::query(
        r#"
        SELECT rank FROM user_connections
        WHERE user_id = ? AND provider_id = ? AND provider_user_id = ?
        "#,
    )
    .bind(&connection.user_id)
    .bind(&connection.provider_id)
    .bind(&connection.provider_user_id)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

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
    conn: &mut SqliteConnection,
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
impl ConnectionStore for SqliteConnectionStore {
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
                display_name = ?, profile_url = ?, image_url = ?, access_token = ?,
                refresh_token = ?, expire_time = ?, token_id = ?
            WHERE user_id = ? AND provider_id = ? AND provider_user_id = ?
            "#,
        )
        .bind(&connection.display_name)
        .bind(&connection.profile_url)
        .bind(&connection.image_url)
        .bind(&connection.access_token)
        .bind(&connection.refresh_token)
        .bind(connection.expire_time)
        .bind(connection.token_id)
        .bind(&connection.user_id)
        .bind(&connection.provider_id)
        .bind(&connection.provider_user_id)
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
            UPDATE user_connections SET access_token = ?, refresh_token = ?, expire_time = ?
            WHERE token_id = ?
            "#,
        )
        .bind(&token.access_token)
        .bind(&token.refresh_token)
        .bind(token.expire_time)
        .bind(token.id)
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
            WHERE provider_id = ? AND provider_user_id = ?
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
            WHERE user_id = ? AND (? IS NULL OR provider_id = ?)
            ORDER BY provider_id, rank
            "#,
        )
        .bind(user_id)
        .bind(provider_id)
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
                access_token = ?, refresh_token = ?, token_type = ?, scope = ?,
                expire_time = ?, enable_refresh = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&token.access_token)
        .bind(&token.refresh_token)
        .bind(&token.token_type)
        .bind(&token.scope)
        .bind(token.expire_time)
        .bind(token.enable_refresh)
        .bind(token.updated_at.to_rfc3339())
        .bind(token.id)
        .execute(&mut *tx)
        .await
        .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("token {}", token.id)));
        }

        sqlx::query(
            r#"
            UPDATE user_connections SET access_token = ?, refresh_token = ?, expire_time = ?
            WHERE token_id = ?
            "#,
        )
        .bind(&token.access_token)
        .bind(&token.refresh_token)
        .bind(token.expire_time)
        .bind(token.id)
        .execute(&mut *tx)
        .await
        .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StorageError::DatabaseError(e.to_string()))?;
        Ok(())
    }
}
