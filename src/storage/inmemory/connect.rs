//! In-memory connection, token and local identity storage
//!
//! All tables live behind one mutex so rank allocation, binding writes and the
//! token-plus-connections update are atomic.

use crate::errors::StorageError;
use crate::provider::ExternalProfile;
use crate::storage::traits::*;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;

#[derive(Default)]
struct Tables {
    last_token_id: i64,
    tokens: BTreeMap<i64, TokenRecord>,
    connections: Vec<Connection>,
    users: HashMap<String, LocalIdentity>,
}

impl Tables {
    fn propagate_token(&mut self, token: &TokenRecord) {
        for connection in self
            .connections
            .iter_mut()
            .filter(|connection| connection.token_id == Some(token.id))
        {
            connection.apply_token(token);
        }
    }

    fn push_token(&mut self, token: &TokenRecord) -> i64 {
        self.last_token_id += 1;
        let id = self.last_token_id;
        self.tokens.insert(
            id,
            TokenRecord {
                id,
                ..token.clone()
            },
        );
        id
    }

    fn check_new_connection(&self, connection: &Connection) -> Result<()> {
        if self.connections.iter().any(|existing| {
            existing.user_id == connection.user_id
                && existing.provider_id == connection.provider_id
                && existing.provider_user_id == connection.provider_user_id
        }) {
            return Err(StorageError::Conflict(format!(
                "connection {}/{} already bound to user {}",
                connection.provider_id, connection.provider_user_id, connection.user_id
            )));
        }
        Ok(())
    }

    /// Append a checked connection with rank `max + 1` for its (user, provider)
    fn push_connection(&mut self, connection: Connection) -> Connection {
        let rank = self
            .connections
            .iter()
            .filter(|existing| {
                existing.user_id == connection.user_id
                    && existing.provider_id == connection.provider_id
            })
            .map(|existing| existing.rank)
            .max()
            .unwrap_or(0)
            + 1;

        let stored = Connection { rank, ..connection };
        self.connections.push(stored.clone());
        stored
    }

    /// Token and connection together; nothing is written when the connection is rejected
    fn push_binding(&mut self, token: &TokenRecord, connection: &Connection) -> Result<Connection> {
        let token_id = self.last_token_id + 1;
        let connection = Connection {
            token_id: Some(token_id),
            ..connection.clone()
        };
        self.check_new_connection(&connection)
            .map_err(|e| StorageError::BindingRolledBack {
                token_id,
                message: e.to_string(),
            })?;

        self.push_token(token);
        Ok(self.push_connection(connection))
    }

    fn check_username(&self, username: &str) -> Result<()> {
        if self.users.values().any(|user| user.username == username) {
            return Err(StorageError::Conflict(format!(
                "username {} already taken",
                username
            )));
        }
        Ok(())
    }
}

fn new_identity(profile: &ExternalProfile, username: &str, authorities: &[String]) -> LocalIdentity {
    LocalIdentity {
        user_id: ulid::Ulid::new().to_string(),
        username: username.to_string(),
        authorities: authorities.to_vec(),
        nickname: profile.nickname.clone(),
        avatar: profile.avatar.clone(),
        created_at: Utc::now(),
    }
}

/// In-memory implementation of [`ConnectStorage`]
#[derive(Default)]
pub struct MemoryConnectStorage {
    tables: Mutex<Tables>,
}

impl MemoryConnectStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token ids currently stored, ascending
    pub async fn token_ids(&self) -> Vec<i64> {
        self.tables.lock().await.tokens.keys().copied().collect()
    }
}

#[async_trait]
impl TokenStore for MemoryConnectStorage {
    async fn insert_token(&self, token: &TokenRecord) -> Result<i64> {
        Ok(self.tables.lock().await.push_token(token))
    }

    async fn get_token(&self, token_id: i64) -> Result<Option<TokenRecord>> {
        Ok(self.tables.lock().await.tokens.get(&token_id).cloned())
    }

    async fn update_token(&self, token: &TokenRecord) -> Result<()> {
        let mut tables = self.tables.lock().await;
        match tables.tokens.get_mut(&token.id) {
            Some(stored) => {
                *stored = token.clone();
                Ok(())
            }
            None => Err(StorageError::NotFound(format!("token {}", token.id))),
        }
    }

    async fn disable_refresh(&self, token_id: i64) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let token = tables
            .tokens
            .get_mut(&token_id)
            .ok_or_else(|| StorageError::NotFound(format!("token {}", token_id)))?;
        token.enable_refresh = false;
        token.updated_at = Utc::now();
        Ok(())
    }

    async fn max_token_id(&self) -> Result<i64> {
        let tables = self.tables.lock().await;
        Ok(tables.tokens.keys().next_back().copied().unwrap_or(0))
    }

    async fn find_expiring_tokens(
        &self,
        start_id: i64,
        end_id: i64,
        deadline: i64,
    ) -> Result<Vec<TokenRecord>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .tokens
            .range(start_id..=end_id)
            .map(|(_, token)| token)
            .filter(|token| token.is_refresh_candidate(deadline))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ConnectionStore for MemoryConnectStorage {
    async fn add_connection(&self, connection: &Connection) -> Result<Connection> {
        let mut tables = self.tables.lock().await;
        tables.check_new_connection(connection)?;
        Ok(tables.push_connection(connection.clone()))
    }

    async fn insert_token_and_connection(
        &self,
        token: &TokenRecord,
        connection: &Connection,
    ) -> Result<Connection> {
        self.tables.lock().await.push_binding(token, connection)
    }

    async fn update_connection(&self, connection: &Connection) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let stored = tables
            .connections
            .iter_mut()
            .find(|existing| {
                existing.user_id == connection.user_id
                    && existing.provider_id == connection.provider_id
                    && existing.provider_user_id == connection.provider_user_id
            })
            .ok_or_else(|| {
                StorageError::NotFound(format!(
                    "connection {}/{} for user {}",
                    connection.provider_id, connection.provider_user_id, connection.user_id
                ))
            })?;

        // Rank is owned by the store
        let rank = stored.rank;
        *stored = Connection {
            rank,
            ..connection.clone()
        };
        Ok(())
    }

    async fn update_connection_by_token_id(&self, token: &TokenRecord) -> Result<()> {
        self.tables.lock().await.propagate_token(token);
        Ok(())
    }

    async fn find_connections_by_provider_user(
        &self,
        provider_id: &str,
        provider_user_id: &str,
    ) -> Result<Vec<Connection>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .connections
            .iter()
            .filter(|c| c.provider_id == provider_id && c.provider_user_id == provider_user_id)
            .cloned()
            .collect())
    }

    async fn find_connections_by_user(
        &self,
        user_id: &str,
        provider_id: Option<&str>,
    ) -> Result<Vec<Connection>> {
        let tables = self.tables.lock().await;
        let mut connections: Vec<Connection> = tables
            .connections
            .iter()
            .filter(|c| c.user_id == user_id)
            .filter(|c| provider_id.is_none_or(|provider_id| c.provider_id == provider_id))
            .cloned()
            .collect();
        connections.sort_by(|a, b| {
            a.provider_id
                .cmp(&b.provider_id)
                .then_with(|| a.rank.cmp(&b.rank))
        });
        Ok(connections)
    }

    async fn persist_refreshed_token(&self, token: &TokenRecord) -> Result<()> {
        let mut tables = self.tables.lock().await;
        match tables.tokens.get_mut(&token.id) {
            Some(stored) => *stored = token.clone(),
            None => return Err(StorageError::NotFound(format!("token {}", token.id))),
        }
        tables.propagate_token(token);
        Ok(())
    }
}

#[async_trait]
impl LocalIdentityService for MemoryConnectStorage {
    async fn find_by_external_id(
        &self,
        provider_id: &str,
        provider_user_id: &str,
    ) -> Result<Option<LocalIdentity>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .connections
            .iter()
            .filter(|c| c.provider_id == provider_id && c.provider_user_id == provider_user_id)
            .find_map(|c| tables.users.get(&c.user_id))
            .cloned())
    }

    async fn find_by_user_id(&self, user_id: &str) -> Result<Option<LocalIdentity>> {
        Ok(self.tables.lock().await.users.get(user_id).cloned())
    }

    async fn register_from_external(
        &self,
        profile: &ExternalProfile,
        username: &str,
        authorities: &[String],
    ) -> Result<LocalIdentity> {
        let mut tables = self.tables.lock().await;
        tables.check_username(username)?;

        let identity = new_identity(profile, username, authorities);
        tables
            .users
            .insert(identity.user_id.clone(), identity.clone());
        Ok(identity)
    }

    async fn register_and_bind(
        &self,
        profile: &ExternalProfile,
        username: &str,
        authorities: &[String],
        token: &TokenRecord,
        connection: &Connection,
    ) -> Result<(LocalIdentity, Connection)> {
        let mut tables = self.tables.lock().await;
        tables.check_username(username)?;

        let identity = new_identity(profile, username, authorities);
        let connection = Connection {
            user_id: identity.user_id.clone(),
            ..connection.clone()
        };
        let stored = tables.push_binding(token, &connection)?;
        tables
            .users
            .insert(identity.user_id.clone(), identity.clone());
        Ok((identity, stored))
    }

    async fn username_exists(&self, candidates: &[String]) -> Result<Vec<bool>> {
        let tables = self.tables.lock().await;
        Ok(candidates
            .iter()
            .map(|candidate| tables.users.values().any(|user| &user.username == candidate))
            .collect())
    }
}
