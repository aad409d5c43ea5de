//! Trait-based storage abstractions with in-memory, SQLite, and PostgreSQL backends.

pub mod cipher;
pub mod inmemory;
pub mod traits;

// Feature-gated storage implementations
#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use cipher::{EncryptedStorage, TokenCipher};
pub use inmemory::MemoryConnectStorage;
pub use traits::*;

#[cfg(feature = "postgres")]
pub use postgres::PostgresConnectStorage;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteConnectStorage;

use crate::errors::StorageError;
use std::sync::Arc;

const AUTHORITY_SEPARATOR: char = ',';

/// Storage backend configuration and factory
#[derive(Clone)]
#[cfg_attr(any(debug_assertions, test), derive(Debug))]
pub enum StorageBackend {
    Memory,
    #[cfg(feature = "sqlite")]
    Sqlite(String), // Connection string/path
    #[cfg(feature = "postgres")]
    Postgres(String), // Connection string
}

/// Create a storage backend based on configuration
pub async fn create_storage_backend(
    backend: StorageBackend,
) -> std::result::Result<Arc<dyn ConnectStorage>, StorageError> {
    match backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryConnectStorage::new())),
        #[cfg(feature = "sqlite")]
        StorageBackend::Sqlite(database_url) => {
            let options = database_url
                .parse::<sqlx::sqlite::SqliteConnectOptions>()
                .map_err(|e| {
                    StorageError::ConnectionFailed(format!("Invalid SQLite URL: {}", e))
                })?
                .create_if_missing(true);
            let pool = sqlx::SqlitePool::connect_with(options).await.map_err(|e| {
                StorageError::ConnectionFailed(format!("SQLite connection failed: {}", e))
            })?;

            let storage = sqlite::SqliteConnectStorage::new(pool);

            // Run migrations
            storage.migrate().await?;

            Ok(Arc::new(storage))
        }
        #[cfg(feature = "postgres")]
        StorageBackend::Postgres(database_url) => {
            let pool = sqlx::postgres::PgPool::connect(&database_url)
                .await
                .map_err(|e| {
                    StorageError::ConnectionFailed(format!("PostgreSQL connection failed: {}", e))
                })?;

            let storage = postgres::PostgresConnectStorage::new(pool);

            // Run migrations
            storage.migrate().await?;

            Ok(Arc::new(storage))
        }
    }
}

/// Parse storage backend from configuration string
pub fn parse_storage_backend(
    backend_name: &str,
    #[cfg_attr(not(any(feature = "sqlite", feature = "postgres")), allow(unused_variables))]
    database_url: Option<&str>,
) -> std::result::Result<StorageBackend, StorageError> {
    match backend_name {
        "memory" => Ok(StorageBackend::Memory),
        #[cfg(feature = "sqlite")]
        "sqlite" => {
            let url = database_url.unwrap_or("sqlite:social-connect.db");
            Ok(StorageBackend::Sqlite(url.to_string()))
        }
        #[cfg(feature = "postgres")]
        "postgres" => {
            let url = database_url.ok_or_else(|| {
                StorageError::InvalidData("DATABASE_URL required for postgres backend".to_string())
            })?;
            Ok(StorageBackend::Postgres(url.to_string()))
        }
        _ => Err(StorageError::InvalidData(format!(
            "Unknown storage backend: {}",
            backend_name
        ))),
    }
}

/// Map a failed write, surfacing unique constraint violations as conflicts
#[cfg(any(feature = "sqlite", feature = "postgres"))]
pub(crate) fn sql_write_error(e: sqlx::Error) -> StorageError {
    match e {
        sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
            StorageError::Conflict(db_err.message().to_string())
        }
        other => StorageError::DatabaseError(other.to_string()),
    }
}

#[cfg_attr(not(any(feature = "sqlite", feature = "postgres")), allow(dead_code))]
pub(crate) fn join_authorities(authorities: &[String]) -> String {
    authorities.join(&AUTHORITY_SEPARATOR.to_string())
}

#[cfg_attr(not(any(feature = "sqlite", feature = "postgres")), allow(dead_code))]
pub(crate) fn split_authorities(value: &str) -> Vec<String> {
    value
        .split(AUTHORITY_SEPARATOR)
        .map(str::trim)
        .filter(|authority| !authority.is_empty())
        .map(str::to_string)
        .collect()
}
