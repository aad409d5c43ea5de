//! Token-at-rest encryption layered over any [`ConnectStorage`].
//!
//! Access and refresh tokens are sealed with AES-256-GCM before they reach the
//! backend and opened again on every read. Stored form is
//! `base64(nonce || ciphertext)`.

use crate::errors::StorageError;
use crate::provider::ExternalProfile;
use crate::storage::traits::*;
use aes_gcm::{
    Aes256Gcm,
    aead::{Aead, AeadCore, KeyInit, OsRng, generic_array::GenericArray},
};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use sha2::{Digest, Sha256};
use std::sync::Arc;

const NONCE_LEN: usize = 12;

/// AES-256-GCM codec keyed by the SHA-256 of a configured secret
#[derive(Clone)]
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl TokenCipher {
    pub fn new(secret: &str) -> Self {
        let key: [u8; 32] = Sha256::digest(secret.as_bytes()).into();
        Self {
            cipher: Aes256Gcm::new(&key.into()),
        }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| StorageError::CipherFailed(format!("encryption failed: {e}")))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(general_purpose::STANDARD.encode(sealed))
    }

    pub fn decrypt(&self, sealed: &str) -> Result<String> {
        let bytes = general_purpose::STANDARD
            .decode(sealed)
            .map_err(|e| StorageError::CipherFailed(format!("invalid encoding: {e}")))?;
        if bytes.len() <= NONCE_LEN {
            return Err(StorageError::CipherFailed("ciphertext too short".to_string()));
        }

        let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(GenericArray::from_slice(nonce), ciphertext)
            .map_err(|e| StorageError::CipherFailed(format!("decryption failed: {e}")))?;

        String::from_utf8(plaintext)
            .map_err(|e| StorageError::CipherFailed(format!("plaintext is not UTF-8: {e}")))
    }

    fn encrypt_optional(&self, value: &Option<String>) -> Result<Option<String>> {
        value.as_deref().map(|v| self.encrypt(v)).transpose()
    }

    fn decrypt_optional(&self, value: &Option<String>) -> Result<Option<String>> {
        value.as_deref().map(|v| self.decrypt(v)).transpose()
    }

    fn seal_token(&self, token: &TokenRecord) -> Result<TokenRecord> {
        Ok(TokenRecord {
            access_token: self.encrypt(&token.access_token)?,
            refresh_token: self.encrypt_optional(&token.refresh_token)?,
            ..token.clone()
        })
    }

    fn open_token(&self, token: TokenRecord) -> Result<TokenRecord> {
        Ok(TokenRecord {
            access_token: self.decrypt(&token.access_token)?,
            refresh_token: self.decrypt_optional(&token.refresh_token)?,
            ..token
        })
    }

    fn seal_connection(&self, connection: &Connection) -> Result<Connection> {
        Ok(Connection {
            access_token: self.encrypt(&connection.access_token)?,
            refresh_token: self.encrypt_optional(&connection.refresh_token)?,
            ..connection.clone()
        })
    }

    fn open_connection(&self, connection: Connection) -> Result<Connection> {
        Ok(Connection {
            access_token: self.decrypt(&connection.access_token)?,
            refresh_token: self.decrypt_optional(&connection.refresh_token)?,
            ..connection
        })
    }
}

/// Storage decorator applying [`TokenCipher`] on every token-bearing read and write
pub struct EncryptedStorage {
    inner: Arc<dyn ConnectStorage>,
    cipher: TokenCipher,
}

impl EncryptedStorage {
    pub fn new(inner: Arc<dyn ConnectStorage>, cipher: TokenCipher) -> Self {
        Self { inner, cipher }
    }
}

#[async_trait]
impl TokenStore for EncryptedStorage {
    async fn insert_token(&self, token: &TokenRecord) -> Result<i64> {
        self.inner.insert_token(&self.cipher.seal_token(token)?).await
    }

    async fn get_token(&self, token_id: i64) -> Result<Option<TokenRecord>> {
        self.inner
            .get_token(token_id)
            .await?
            .map(|token| self.cipher.open_token(token))
            .transpose()
    }

    async fn update_token(&self, token: &TokenRecord) -> Result<()> {
        self.inner.update_token(&self.cipher.seal_token(token)?).await
    }

    async fn disable_refresh(&self, token_id: i64) -> Result<()> {
        self.inner.disable_refresh(token_id).await
    }

    async fn max_token_id(&self) -> Result<i64> {
        self.inner.max_token_id().await
    }

    async fn find_expiring_tokens(
        &self,
        start_id: i64,
        end_id: i64,
        deadline: i64,
    ) -> Result<Vec<TokenRecord>> {
        // Rows sealed under another secret or corrupted are skipped so the
        // rest of the batch still refreshes
        let tokens = self
            .inner
            .find_expiring_tokens(start_id, end_id, deadline)
            .await?
            .into_iter()
            .filter_map(|token| {
                let token_id = token.id;
                match self.cipher.open_token(token) {
                    Ok(token) => Some(token),
                    Err(e) => {
                        tracing::warn!(token_id, error = ?e, "skipping undecryptable token");
                        None
                    }
                }
            })
            .collect();
        Ok(tokens)
    }
}

#[async_trait]
impl ConnectionStore for EncryptedStorage {
    async fn add_connection(&self, connection: &Connection) -> Result<Connection> {
        let stored = self
            .inner
            .add_connection(&self.cipher.seal_connection(connection)?)
            .await?;
        self.cipher.open_connection(stored)
    }

    async fn insert_token_and_connection(
        &self,
        token: &TokenRecord,
        connection: &Connection,
    ) -> Result<Connection> {
        let stored = self
            .inner
            .insert_token_and_connection(
                &self.cipher.seal_token(token)?,
                &self.cipher.seal_connection(connection)?,
            )
            .await?;
        self.cipher.open_connection(stored)
    }

    async fn update_connection(&self, connection: &Connection) -> Result<()> {
        self.inner
            .update_connection(&self.cipher.seal_connection(connection)?)
            .await
    }

    async fn update_connection_by_token_id(&self, token: &TokenRecord) -> Result<()> {
        self.inner
            .update_connection_by_token_id(&self.cipher.seal_token(token)?)
            .await
    }

    async fn find_connections_by_provider_user(
        &self,
        provider_id: &str,
        provider_user_id: &str,
    ) -> Result<Vec<Connection>> {
        self.inner
            .find_connections_by_provider_user(provider_id, provider_user_id)
            .await?
            .into_iter()
            .map(|connection| self.cipher.open_connection(connection))
            .collect()
    }

    async fn find_connections_by_user(
        &self,
        user_id: &str,
        provider_id: Option<&str>,
    ) -> Result<Vec<Connection>> {
        self.inner
            .find_connections_by_user(user_id, provider_id)
            .await?
            .into_iter()
            .map(|connection| self.cipher.open_connection(connection))
            .collect()
    }

    async fn persist_refreshed_token(&self, token: &TokenRecord) -> Result<()> {
        self.inner
            .persist_refreshed_token(&self.cipher.seal_token(token)?)
            .await
    }
}

#[async_trait]
impl LocalIdentityService for EncryptedStorage {
    async fn find_by_external_id(
        &self,
        provider_id: &str,
        provider_user_id: &str,
    ) -> Result<Option<LocalIdentity>> {
        self.inner
            .find_by_external_id(provider_id, provider_user_id)
            .await
    }

    async fn find_by_user_id(&self, user_id: &str) -> Result<Option<LocalIdentity>> {
        self.inner.find_by_user_id(user_id).await
    }

    async fn register_from_external(
        &self,
        profile: &ExternalProfile,
        username: &str,
        authorities: &[String],
    ) -> Result<LocalIdentity> {
        self.inner
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
        let (identity, stored) = self
            .inner
            .register_and_bind(
                profile,
                username,
                authorities,
                &self.cipher.seal_token(token)?,
                &self.cipher.seal_connection(connection)?,
            )
            .await?;
        Ok((identity, self.cipher.open_connection(stored)?))
    }

    async fn username_exists(&self, candidates: &[String]) -> Result<Vec<bool>> {
        self.inner.username_exists(candidates).await
    }
}
