//! Identity resolution for a fetched external profile.
//!
//! An external account already bound to a local user resolves to that user.
//! Otherwise a local account is registered (when auto sign-up is on) or an
//! unpersisted temporary identity is handed back for a sign-up continuation.

use super::ConnectSettings;
use crate::errors::{ConnectError, StorageError};
use crate::executor::BoundedExecutor;
use crate::provider::ExternalProfile;
use crate::storage::traits::{Connection, ConnectStorage, LocalIdentity, TokenRecord};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Identity handed to callers that must finish sign-up themselves
#[derive(Clone)]
#[cfg_attr(any(debug_assertions, test), derive(Debug))]
pub struct TemporaryIdentity {
    pub username: String,
    pub password: String,
    pub authorities: Vec<String>,
    pub profile: ExternalProfile,
}

#[derive(Clone)]
#[cfg_attr(any(debug_assertions, test), derive(Debug))]
pub enum ResolvedIdentity {
    /// The external account was already bound to this local user
    Bound(LocalIdentity),
    /// A local user was created and bound during this login
    AutoRegistered(LocalIdentity),
    /// Nothing was persisted
    Temporary(TemporaryIdentity),
}

impl ResolvedIdentity {
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::Bound(_) => "bound",
            Self::AutoRegistered(_) => "auto_registered",
            Self::Temporary(_) => "temporary",
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            Self::Bound(identity) | Self::AutoRegistered(identity) => Some(&identity.user_id),
            Self::Temporary(_) => None,
        }
    }

    pub fn username(&self) -> &str {
        match self {
            Self::Bound(identity) | Self::AutoRegistered(identity) => &identity.username,
            Self::Temporary(temporary) => &temporary.username,
        }
    }

    pub fn authorities(&self) -> &[String] {
        match self {
            Self::Bound(identity) | Self::AutoRegistered(identity) => &identity.authorities,
            Self::Temporary(temporary) => &temporary.authorities,
        }
    }
}

/// Username an external profile maps to: its username, or the provider user id when blank
fn base_username(profile: &ExternalProfile) -> &str {
    let username = profile.username.trim();
    if username.is_empty() {
        &profile.provider_user_id
    } else {
        username
    }
}

/// Auto sign-up usernames in preference order
pub fn username_candidates(profile: &ExternalProfile) -> [String; 3] {
    let base = base_username(profile);
    [
        base.to_string(),
        format!("{}_{}", base, profile.provider_id),
        format!(
            "{}_{}_{}",
            base, profile.provider_id, profile.provider_user_id
        ),
    ]
}

pub struct IdentityResolver {
    storage: Arc<dyn ConnectStorage>,
    binding_pool: BoundedExecutor,
    settings: Arc<ConnectSettings>,
}

impl IdentityResolver {
    pub fn new(
        storage: Arc<dyn ConnectStorage>,
        binding_pool: BoundedExecutor,
        settings: Arc<ConnectSettings>,
    ) -> Self {
        Self {
            storage,
            binding_pool,
            settings,
        }
    }

    pub async fn resolve(
        &self,
        profile: &ExternalProfile,
        now: DateTime<Utc>,
    ) -> Result<ResolvedIdentity, ConnectError> {
        let connections = self
            .storage
            .find_connections_by_provider_user(&profile.provider_id, &profile.provider_user_id)
            .await?;

        if let Some(connection) = connections.first() {
            if connections.iter().any(|c| c.user_id != connection.user_id) {
                tracing::warn!(
                    provider_id = %profile.provider_id,
                    provider_user_id = %profile.provider_user_id,
                    count = connections.len(),
                    "external account bound to several local users, using the first"
                );
            }

            let identity = self
                .storage
                .find_by_user_id(&connection.user_id)
                .await?
                .ok_or_else(|| {
                    ConnectError::persistence(format!(
                        "connection references missing user {}",
                        connection.user_id
                    ))
                })?;

            self.refresh_binding(connection.clone(), profile.clone(), now)
                .await;
            return Ok(ResolvedIdentity::Bound(identity));
        }

        if self.settings.auto_sign_up {
            return self.auto_register(profile, now).await;
        }

        Ok(ResolvedIdentity::Temporary(TemporaryIdentity {
            username: base_username(profile).to_string(),
            password: self.settings.temporary_password.clone(),
            authorities: self.settings.temporary_authorities.clone(),
            profile: profile.clone(),
        }))
    }

    /// Bind an external profile to an existing local user, e.g. after a
    /// temporary identity completed sign-up.
    pub async fn bind_to_existing(
        &self,
        identity: &LocalIdentity,
        profile: &ExternalProfile,
    ) -> Result<Connection, ConnectError> {
        persist_binding(self.storage.as_ref(), &identity.user_id, profile, Utc::now()).await
    }

    async fn auto_register(
        &self,
        profile: &ExternalProfile,
        now: DateTime<Utc>,
    ) -> Result<ResolvedIdentity, ConnectError> {
        let candidates = username_candidates(profile);
        let taken = self.storage.username_exists(&candidates).await?;

        let username = candidates
            .iter()
            .zip(taken.iter().chain(std::iter::repeat(&true)))
            .find(|(_, taken)| !**taken)
            .map(|(candidate, _)| candidate.clone())
            .ok_or_else(|| ConnectError::UsernameExhausted(base_username(profile).to_string()))?;

        let token = profile.token.to_token_record(&profile.provider_id, now);
        let connection = Connection::from_profile("", profile, &token);
        let authorities = &self.settings.default_authorities;

        let mut attempt = self
            .storage
            .register_and_bind(profile, &username, authorities, &token, &connection)
            .await;
        if let Err(StorageError::BindingRolledBack { token_id, message }) = &attempt {
            tracing::warn!(token_id = *token_id, error = %message, "registration binding failed, retrying");
            attempt = self
                .storage
                .register_and_bind(profile, &username, authorities, &token, &connection)
                .await;
        }

        let (identity, _) = attempt.map_err(|e| match e {
            // Another login claimed the name between the check and the insert
            StorageError::Conflict(_) => ConnectError::UsernameExhausted(username.clone()),
            other => other.into(),
        })?;

        tracing::info!(
            provider_id = %profile.provider_id,
            user_id = %identity.user_id,
            username = %identity.username,
            "registered local user from external profile"
        );
        Ok(ResolvedIdentity::AutoRegistered(identity))
    }

    /// Write the fresh token and profile fields back to an existing binding on the binding pool.
    async fn refresh_binding(
        &self,
        connection: Connection,
        profile: ExternalProfile,
        now: DateTime<Utc>,
    ) {
        let storage = self.storage.clone();
        self.binding_pool
            .submit(async move {
                if let Err(e) = write_back(storage.as_ref(), connection, &profile, now).await {
                    tracing::warn!(
                        provider_id = %profile.provider_id,
                        provider_user_id = %profile.provider_user_id,
                        error = ?e,
                        "failed to update existing connection"
                    );
                }
            })
            .await;
    }
}

async fn write_back(
    storage: &dyn ConnectStorage,
    mut connection: Connection,
    profile: &ExternalProfile,
    now: DateTime<Utc>,
) -> Result<(), StorageError> {
    let mut token = profile.token.to_token_record(&profile.provider_id, now);

    let existing = match connection.token_id {
        Some(token_id) => storage.get_token(token_id).await?.map(|stored| stored.id),
        None => None,
    };
    match existing {
        Some(token_id) => {
            token.id = token_id;
            storage.update_token(&token).await?;
        }
        None => token.id = storage.insert_token(&token).await?,
    }

    let fresh = Connection::from_profile(&connection.user_id, profile, &token);
    connection.display_name = fresh.display_name;
    connection.profile_url = fresh.profile_url;
    connection.image_url = fresh.image_url;
    connection.token_id = Some(token.id);
    connection.apply_token(&token);
    storage.update_connection(&connection).await
}

/// Insert the token and connection as one unit. A rolled-back connection
/// write is retried once; a second failure reports the token id it used.
async fn persist_binding(
    storage: &dyn ConnectStorage,
    user_id: &str,
    profile: &ExternalProfile,
    now: DateTime<Utc>,
) -> Result<Connection, ConnectError> {
    let token: TokenRecord = profile.token.to_token_record(&profile.provider_id, now);
    let connection = Connection::from_profile(user_id, profile, &token);

    match storage.insert_token_and_connection(&token, &connection).await {
        Ok(stored) => Ok(stored),
        Err(first @ StorageError::BindingRolledBack { .. }) => {
            tracing::warn!(error = ?first, "connection write failed, retrying");
            Ok(storage
                .insert_token_and_connection(&token, &connection)
                .await?)
        }
        Err(other) => Err(other.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderToken;
    use crate::storage::inmemory::MemoryConnectStorage;
    use crate::storage::traits::{ConnectionStore, LocalIdentityService, TokenStore};

    fn profile(username: &str) -> ExternalProfile {
        ExternalProfile {
            provider_id: "gitee".to_string(),
            provider_user_id: "1001".to_string(),
            username: username.to_string(),
            nickname: Some("Alice".to_string()),
            avatar: None,
            profile_url: None,
            email: None,
            raw: serde_json::Value::Null,
            token: ProviderToken {
                access_token: "access".to_string(),
                refresh_token: Some("refresh".to_string()),
                expires_in: Some(3600),
                token_type: Some("bearer".to_string()),
                scope: None,
            },
        }
    }

    fn resolver(storage: Arc<MemoryConnectStorage>, auto_sign_up: bool) -> IdentityResolver {
        IdentityResolver::new(
            storage,
            BoundedExecutor::new("binding", 2),
            Arc::new(ConnectSettings {
                auto_sign_up,
                temporary_password: "shared-secret".to_string(),
                ..ConnectSettings::default()
            }),
        )
    }

    async fn take_username(storage: &MemoryConnectStorage, username: &str) {
        storage
            .register_from_external(&profile(username), username, &[])
            .await
            .unwrap();
    }

    #[test]
    fn test_username_candidates() {
        assert_eq!(
            username_candidates(&profile("alice")),
            [
                "alice".to_string(),
                "alice_gitee".to_string(),
                "alice_gitee_1001".to_string()
            ]
        );
        assert_eq!(username_candidates(&profile("  "))[0], "1001");
    }

    #[tokio::test]
    async fn test_username_fallback_order() {
        let storage = Arc::new(MemoryConnectStorage::new());
        take_username(&storage, "alice").await;

        let resolved = resolver(storage.clone(), true)
            .resolve(&profile("alice"), Utc::now())
            .await
            .unwrap();
        assert_eq!(resolved.username(), "alice_gitee");

        let storage = Arc::new(MemoryConnectStorage::new());
        take_username(&storage, "alice").await;
        take_username(&storage, "alice_gitee").await;
        let resolved = resolver(storage, true)
            .resolve(&profile("alice"), Utc::now())
            .await
            .unwrap();
        assert_eq!(resolved.username(), "alice_gitee_1001");
    }

    #[tokio::test]
    async fn test_username_exhausted_writes_nothing() {
        let storage = Arc::new(MemoryConnectStorage::new());
        for taken in username_candidates(&profile("alice")) {
            take_username(&storage, &taken).await;
        }

        let result = resolver(storage.clone(), true)
            .resolve(&profile("alice"), Utc::now())
            .await;
        assert!(matches!(result, Err(ConnectError::UsernameExhausted(_))));
        assert_eq!(storage.max_token_id().await.unwrap(), 0);
        assert!(
            storage
                .find_connections_by_provider_user("gitee", "1001")
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_temporary_identity_when_sign_up_disabled() {
        let storage = Arc::new(MemoryConnectStorage::new());
        let resolved = resolver(storage.clone(), false)
            .resolve(&profile("alice"), Utc::now())
            .await
            .unwrap();

        match resolved {
            ResolvedIdentity::Temporary(temporary) => {
                assert_eq!(temporary.username, "alice");
                assert_eq!(temporary.password, "shared-secret");
                assert_eq!(temporary.authorities, vec!["ROLE_TEMPORARY_USER".to_string()]);
            }
            other => panic!("expected temporary identity, got {other:?}"),
        }
        assert_eq!(storage.max_token_id().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_relogin_binds_and_writes_back_token() {
        let storage = Arc::new(MemoryConnectStorage::new());
        let resolver = resolver(storage.clone(), true);

        let first = resolver.resolve(&profile("alice"), Utc::now()).await.unwrap();
        assert!(matches!(first, ResolvedIdentity::AutoRegistered(_)));
        let token_id = storage.max_token_id().await.unwrap();
        storage.disable_refresh(token_id).await.unwrap();

        let mut again = profile("alice");
        again.token.access_token = "access-2".to_string();
        let second = resolver.resolve(&again, Utc::now()).await.unwrap();
        assert!(matches!(second, ResolvedIdentity::Bound(_)));
        assert_eq!(second.user_id(), first.user_id());

        resolver.binding_pool.drain().await;
        let token = storage.get_token(token_id).await.unwrap().unwrap();
        assert_eq!(token.access_token, "access-2");
        assert!(token.enable_refresh);
        let connections = storage
            .find_connections_by_provider_user("gitee", "1001")
            .await
            .unwrap();
        assert_eq!(connections.len(), 1);
        assert_eq!(connections[0].access_token, "access-2");
    }

    #[tokio::test]
    async fn test_bind_to_existing_allocates_rank() {
        let storage = Arc::new(MemoryConnectStorage::new());
        let identity = storage
            .register_from_external(&profile("bob"), "bob", &[])
            .await
            .unwrap();

        let resolver = resolver(storage.clone(), false);
        let first = resolver
            .bind_to_existing(&identity, &profile("bob"))
            .await
            .unwrap();
        let mut second_account = profile("bob-alt");
        second_account.provider_user_id = "2002".to_string();
        let second = resolver
            .bind_to_existing(&identity, &second_account)
            .await
            .unwrap();

        assert_eq!((first.rank, second.rank), (1, 2));
        assert_eq!(
            storage
                .find_by_external_id("gitee", "2002")
                .await
                .unwrap()
                .map(|found| found.user_id),
            Some(identity.user_id)
        );
    }
}
