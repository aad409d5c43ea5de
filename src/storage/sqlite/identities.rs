//! SQLite implementation for local identity storage

use crate::errors::StorageError;
use crate::provider::ExternalProfile;
use crate::storage::sql_write_error;
use crate::storage::traits::{Connection, LocalIdentity, LocalIdentityService, Result, TokenRecord};
use crate::storage::{join_authorities, split_authorities};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqliteRow};

use super::connections::insert_binding_rows;

pub struct SqliteIdentityStore {
    pool: SqlitePool,
}

impl SqliteIdentityStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_identity(row: &SqliteRow) -> Result<LocalIdentity> {
        let authorities: String = row.try_get("authorities").map_err(|e| {
            StorageError::DatabaseError(format!("Failed to get authorities: {}", e))
        })?;
        let created_at_str: String = row
            .try_get("created_at")
            .map_err(|e| StorageError::DatabaseError(format!("Failed to get created_at: {}", e)))?;
        let created_at = chrono::DateTime::parse_from_rfc3339(&created_at_str)
            .map_err(|e| StorageError::InvalidData(format!("Invalid created_at timestamp: {}", e)))?
            .with_timezone(&Utc);

        Ok(LocalIdentity {
            user_id: row.try_get("user_id").map_err(|e| {
                StorageError::DatabaseError(format!("Failed to get user_id: {}", e))
            })?,
            username: row.try_get("username").map_err(|e| {
                StorageError::DatabaseError(format!("Failed to get username: {}", e))
            })?,
            authorities: split_authorities(&authorities),
            nickname: row.try_get("nickname").map_err(|e| {
                StorageError::DatabaseError(format!("Failed to get nickname: {}", e))
            })?,
            avatar: row
                .try_get("avatar")
                .map_err(|e| StorageError::DatabaseError(format!("Failed to get avatar: {}", e)))?,
            created_at,
        })
    }
}

async fn insert_identity_row(
    conn: &mut SqliteConnection,
    profile: &ExternalProfile,
    username: &str,
    authorities: &[String],
) -> Result<LocalIdentity> {
    let identity = LocalIdentity {
        user_id: ulid::Ulid::new().to_string(),
        username: username.to_string(),
        authorities: authorities.to_vec(),
        nickname: profile.nickname.clone(),
        avatar: profile.avatar.clone(),
        created_at: Utc::now(),
    };

    sqlx::query(
        r#"
        INSERT INTO local_users (user_id, username, authorities, nickname, avatar, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&identity.user_id)
    .bind(&identity.username)
    .bind(join_authorities(&identity.authorities))
    .bind(&identity.nickname)
    .bind(&identity.avatar)
    .bind(identity.created_at.to_rfc3339())
    .execute(conn)
    .await
    .map_err(sql_write_error)?;

    Ok(identity)
}

#[async_trait]
impl LocalIdentityService for SqliteIdentityStore {
    async fn find_by_external_id(
        &self,
        provider_id: &str,
        provider_user_id: &str,
    ) -> Result<Option<LocalIdentity>> {
        let row = sqlx::query(
            r#"
            SELECT u.* FROM local_users u
            JOIN user_connections c ON c.user_id = u.user_id
            WHERE c.provider_id = ? AND c.provider_user_id = ?
            ORDER BY c.rank
            LIMIT 1
            "#,
        )
        .bind(provider_id)
        .bind(provider_user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        row.as_ref().map(Self::row_to_identity).transpose()
    }

    async fn find_by_user_id(&self, user_id: &str) -> Result<Option<LocalIdentity>> {
        let row = sqlx::query("SELECT * FROM local_users WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        row.as_ref().map(Self::row_to_identity).transpose()
    }

    async fn register_from_external(
        &self,
        profile: &ExternalProfile,
        username: &str,
        authorities: &[String],
    ) -> Result<LocalIdentity> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;
        insert_identity_row(&mut conn, profile, username, authorities).await
    }

    async fn register_and_bind(
        &self,
        profile: &ExternalProfile,
        username: &str,
        authorities: &[String],
        token: &TokenRecord,
        connection: &Connection,
    ) -> Result<(LocalIdentity, Connection)> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::DatabaseError(e.to_string()))?;

        let identity = insert_identity_row(&mut tx, profile, username, authorities).await?;
        let connection = Connection {
            user_id: identity.user_id.clone(),
            ..connection.clone()
        };
        let stored = insert_binding_rows(&mut tx, token, &connection).await?;

        tx.commit()
            .await
            .map_err(|e| StorageError::DatabaseError(e.to_string()))?;
        Ok((identity, stored))
    }

    async fn username_exists(&self, candidates: &[String]) -> Result<Vec<bool>> {
        let mut taken = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let row = sqlx::query("SELECT 1 AS found FROM local_users WHERE username = ?")
                .bind(candidate)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StorageError::DatabaseError(e.to_string()))?;
            taken.push(row.is_some());
        }
        Ok(taken)
    }
}
