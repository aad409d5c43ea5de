//! Authorization round trip tests
//!
//! These tests drive the initiator and callback processor against a mock
//! provider speaking real HTTP, with in-memory storage and state stores.

use async_trait::async_trait;
use serde_json::json;
use social_connect::connect::{
    AuthorizationInitiator, CallbackParams, CallbackProcessor, ConnectSettings, IdentityResolver,
    ResolvedIdentity,
};
use social_connect::errors::{ConnectError, StorageError};
use social_connect::executor::BoundedExecutor;
use social_connect::provider::{ExternalProfile, ProviderConfig, ProviderKind, ProviderRegistry};
use social_connect::state::{
    MemoryAuthorizationContextStore, MemoryStateCache, RedirectStateCoder, StateCache, StateCoder,
    StateKeyStrategy,
};
use social_connect::storage::{
    Connection, ConnectionStore, ConnectStorage, EncryptedStorage, LocalIdentity,
    LocalIdentityService, MemoryConnectStorage, TokenCipher, TokenRecord, TokenStore,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Harness {
    _server: MockServer,
    raw: Arc<MemoryConnectStorage>,
    storage: Arc<dyn ConnectStorage>,
    state_cache: Arc<MemoryStateCache>,
    initiator: AuthorizationInitiator,
    processor: CallbackProcessor,
}

async fn mock_provider(login: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "access-1",
            "refresh_token": "refresh-1",
            "expires_in": 86400,
            "token_type": "bearer"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v5/user"))
        .and(header("authorization", "Bearer access-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 4242,
            "login": login,
            "name": "Octo Cat",
            "avatar_url": "https://img.example.com/octo.png",
            "html_url": "https://gitee.com/octo"
        })))
        .mount(&server)
        .await;
    server
}

async fn harness_with(
    settings: ConnectSettings,
    login: &str,
    wrap: impl FnOnce(Arc<dyn ConnectStorage>) -> Arc<dyn ConnectStorage>,
) -> Harness {
    let server = mock_provider(login).await;
    let registry = Arc::new(
        ProviderRegistry::from_configs(vec![
            ProviderConfig::new("gitee", ProviderKind::Gitee)
                .with_credentials("client-id", "client-secret")
                .with_redirect_uri("https://app.example.com/callback/gitee")
                .with_endpoints(
                    format!("{}/oauth/authorize", server.uri()),
                    format!("{}/oauth/token", server.uri()),
                    format!("{}/api/v5/user", server.uri()),
                ),
        ])
        .unwrap(),
    );

    let raw = Arc::new(MemoryConnectStorage::new());
    let encrypted: Arc<dyn ConnectStorage> = Arc::new(EncryptedStorage::new(
        raw.clone(),
        TokenCipher::new("integration-secret"),
    ));
    let storage = wrap(encrypted);

    let settings = Arc::new(settings);
    let state_cache = Arc::new(MemoryStateCache::new());
    let contexts = Arc::new(MemoryAuthorizationContextStore::new());
    let coder: Option<Arc<dyn StateCoder>> = Some(Arc::new(RedirectStateCoder));
    let resolver = Arc::new(IdentityResolver::new(
        storage.clone(),
        BoundedExecutor::new("binding", 2),
        settings.clone(),
    ));

    Harness {
        _server: server,
        raw,
        storage,
        state_cache: state_cache.clone(),
        initiator: AuthorizationInitiator::new(
            registry.clone(),
            state_cache.clone(),
            contexts.clone(),
            coder.clone(),
            settings.clone(),
        ),
        processor: CallbackProcessor::new(
            registry,
            state_cache,
            contexts,
            coder,
            resolver,
            settings,
        ),
    }
}

async fn harness(settings: ConnectSettings) -> Harness {
    harness_with(settings, "octo", |storage| storage).await
}

impl Harness {
    async fn begin(&self, redirect: Option<&str>) -> String {
        let params: HashMap<String, String> = redirect
            .map(|target| HashMap::from([("redirect".to_string(), target.to_string())]))
            .unwrap_or_default();
        self.initiator
            .initiate("gitee", None, params)
            .await
            .unwrap()
            .state
    }

    async fn callback(&self, state: &str) -> Result<social_connect::connect::CallbackOutcome, ConnectError> {
        self.processor
            .process(
                "gitee",
                CallbackParams {
                    code: Some("code-1".to_string()),
                    state: Some(state.to_string()),
                    ..CallbackParams::default()
                },
            )
            .await
    }
}

#[tokio::test]
async fn test_new_user_auto_sign_up_end_to_end() {
    let h = harness(ConnectSettings::default()).await;
    let state = h.begin(Some("/dashboard")).await;
    let key = StateKeyStrategy::Random.key("gitee", &state);
    assert!(h.state_cache.contains_key(&key).await.unwrap());

    let outcome = h.callback(&state).await.unwrap();
    let ResolvedIdentity::AutoRegistered(identity) = &outcome.identity else {
        panic!("expected auto registration, got {}", outcome.identity.outcome());
    };
    assert_eq!(identity.username, "octo");
    assert_eq!(identity.authorities, vec!["ROLE_USER".to_string()]);
    assert_eq!(outcome.redirect_to, "/dashboard");

    // Exactly one token and one rank-1 connection
    assert_eq!(h.raw.token_ids().await, vec![1]);
    let connections = h
        .storage
        .find_connections_by_user(&identity.user_id, Some("gitee"))
        .await
        .unwrap();
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].rank, 1);
    assert_eq!(connections[0].provider_user_id, "4242");
    assert_eq!(connections[0].access_token, "access-1");

    // Tokens are sealed at rest
    let sealed = h.raw.get_token(1).await.unwrap().unwrap();
    assert_ne!(sealed.access_token, "access-1");
    let opened = h.storage.get_token(1).await.unwrap().unwrap();
    assert_eq!(opened.access_token, "access-1");
    assert_eq!(opened.refresh_token.as_deref(), Some("refresh-1"));

    // The state was consumed
    assert!(!h.state_cache.contains_key(&key).await.unwrap());
}

#[tokio::test]
async fn test_returning_user_is_bound() {
    let h = harness(ConnectSettings::default()).await;
    let first = h.callback(&h.begin(None).await).await.unwrap();
    let second = h.callback(&h.begin(None).await).await.unwrap();

    assert_eq!(second.identity.outcome(), "bound");
    assert_eq!(second.identity.user_id(), first.identity.user_id());
    assert_eq!(second.redirect_to, "/");

    let connections = h
        .storage
        .find_connections_by_provider_user("gitee", "4242")
        .await
        .unwrap();
    assert_eq!(connections.len(), 1);
}

#[tokio::test]
async fn test_username_collision_falls_back() {
    let h = harness(ConnectSettings::default()).await;
    let someone_else = ExternalProfile {
        provider_id: "github".to_string(),
        provider_user_id: "1".to_string(),
        username: "octo".to_string(),
        nickname: None,
        avatar: None,
        profile_url: None,
        email: None,
        raw: serde_json::Value::Null,
        token: social_connect::provider::ProviderToken {
            access_token: "x".to_string(),
            refresh_token: None,
            expires_in: None,
            token_type: None,
            scope: None,
        },
    };
    h.storage
        .register_from_external(&someone_else, "octo", &["ROLE_USER".to_string()])
        .await
        .unwrap();

    let outcome = h.callback(&h.begin(None).await).await.unwrap();
    assert_eq!(outcome.identity.outcome(), "auto_registered");
    assert_eq!(outcome.identity.username(), "octo_gitee");
}

#[tokio::test]
async fn test_replayed_callback_is_rejected() {
    let h = harness(ConnectSettings::default()).await;
    let state = h.begin(None).await;
    h.callback(&state).await.unwrap();

    let replay = h.callback(&state).await;
    assert!(matches!(replay, Err(ConnectError::CsrfState(_))));

    let forged = h.callback("never-issued").await;
    assert!(matches!(forged, Err(ConnectError::CsrfState(_))));
}

#[tokio::test]
async fn test_temporary_identity_then_bind() {
    let settings = ConnectSettings {
        auto_sign_up: false,
        temporary_password: "shared-secret".to_string(),
        ..ConnectSettings::default()
    };
    let h = harness(settings).await;

    let outcome = h.callback(&h.begin(Some("/ignored")).await).await.unwrap();
    let ResolvedIdentity::Temporary(temporary) = &outcome.identity else {
        panic!("expected a temporary identity");
    };
    assert_eq!(temporary.username, "octo");
    assert_eq!(temporary.password, "shared-secret");
    assert_eq!(temporary.authorities, vec!["ROLE_TEMPORARY_USER".to_string()]);
    assert_eq!(outcome.redirect_to, "/signup");
    assert!(h.raw.token_ids().await.is_empty());

    // The sign-up continuation creates the account, then binds the profile
    let account = h
        .storage
        .register_from_external(&outcome.profile, "octo-signed-up", &["ROLE_USER".to_string()])
        .await
        .unwrap();
    let connection = h
        .processor
        .resolver()
        .bind_to_existing(&account, &outcome.profile)
        .await
        .unwrap();
    assert_eq!(connection.rank, 1);
    assert_eq!(connection.user_id, account.user_id);
    assert_eq!(h.raw.token_ids().await, vec![1]);

    let found = h
        .storage
        .find_by_external_id("gitee", "4242")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.username, "octo-signed-up");
}

/// Delegates everything but rejects every connection insert, rolling back
/// whatever was written alongside it
struct RejectingConnections {
    inner: Arc<dyn ConnectStorage>,
    attempts: Arc<AtomicUsize>,
}

impl RejectingConnections {
    async fn rolled_back(&self) -> StorageError {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        match self.inner.max_token_id().await {
            Ok(max) => StorageError::BindingRolledBack {
                token_id: max + 1,
                message: "connection table unavailable".to_string(),
            },
            Err(e) => e,
        }
    }
}

#[async_trait]
impl TokenStore for RejectingConnections {
    async fn insert_token(&self, token: &TokenRecord) -> Result<i64, StorageError> {
        self.inner.insert_token(token).await
    }

    async fn get_token(&self, token_id: i64) -> Result<Option<TokenRecord>, StorageError> {
        self.inner.get_token(token_id).await
    }

    async fn update_token(&self, token: &TokenRecord) -> Result<(), StorageError> {
        self.inner.update_token(token).await
    }

    async fn disable_refresh(&self, token_id: i64) -> Result<(), StorageError> {
        self.inner.disable_refresh(token_id).await
    }

    async fn max_token_id(&self) -> Result<i64, StorageError> {
        self.inner.max_token_id().await
    }

    async fn find_expiring_tokens(
        &self,
        start_id: i64,
        end_id: i64,
        deadline: i64,
    ) -> Result<Vec<TokenRecord>, StorageError> {
        self.inner.find_expiring_tokens(start_id, end_id, deadline).await
    }
}

#[async_trait]
impl ConnectionStore for RejectingConnections {
    async fn add_connection(&self, _connection: &Connection) -> Result<Connection, StorageError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(StorageError::DatabaseError("connection table unavailable".to_string()))
    }

    async fn insert_token_and_connection(
        &self,
        _token: &TokenRecord,
        _connection: &Connection,
    ) -> Result<Connection, StorageError> {
        Err(self.rolled_back().await)
    }

    async fn update_connection(&self, connection: &Connection) -> Result<(), StorageError> {
        self.inner.update_connection(connection).await
    }

    async fn update_connection_by_token_id(&self, token: &TokenRecord) -> Result<(), StorageError> {
        self.inner.update_connection_by_token_id(token).await
    }

    async fn find_connections_by_provider_user(
        &self,
        provider_id: &str,
        provider_user_id: &str,
    ) -> Result<Vec<Connection>, StorageError> {
        self.inner
            .find_connections_by_provider_user(provider_id, provider_user_id)
            .await
    }

    async fn find_connections_by_user(
        &self,
        user_id: &str,
        provider_id: Option<&str>,
    ) -> Result<Vec<Connection>, StorageError> {
        self.inner.find_connections_by_user(user_id, provider_id).await
    }

    async fn persist_refreshed_token(&self, token: &TokenRecord) -> Result<(), StorageError> {
        self.inner.persist_refreshed_token(token).await
    }
}

#[async_trait]
impl LocalIdentityService for RejectingConnections {
    async fn find_by_external_id(
        &self,
        provider_id: &str,
        provider_user_id: &str,
    ) -> Result<Option<LocalIdentity>, StorageError> {
        self.inner.find_by_external_id(provider_id, provider_user_id).await
    }

    async fn find_by_user_id(&self, user_id: &str) -> Result<Option<LocalIdentity>, StorageError> {
        self.inner.find_by_user_id(user_id).await
    }

    async fn register_from_external(
        &self,
        profile: &ExternalProfile,
        username: &str,
        authorities: &[String],
    ) -> Result<LocalIdentity, StorageError> {
        self.inner
            .register_from_external(profile, username, authorities)
            .await
    }

    async fn register_and_bind(
        &self,
        _profile: &ExternalProfile,
        _username: &str,
        _authorities: &[String],
        _token: &TokenRecord,
        _connection: &Connection,
    ) -> Result<(LocalIdentity, Connection), StorageError> {
        Err(self.rolled_back().await)
    }

    async fn username_exists(&self, candidates: &[String]) -> Result<Vec<bool>, StorageError> {
        self.inner.username_exists(candidates).await
    }
}

async fn rejecting_harness(settings: ConnectSettings) -> (Harness, Arc<AtomicUsize>) {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let harness = harness_with(settings, "octo", move |inner| {
        Arc::new(RejectingConnections {
            inner,
            attempts: counter,
        })
    })
    .await;
    (harness, attempts)
}

#[tokio::test]
async fn test_failed_registration_leaves_no_account() {
    let (h, attempts) = rejecting_harness(ConnectSettings::default()).await;

    let result = h.callback(&h.begin(None).await).await;
    match result {
        Err(ConnectError::Persistence {
            orphaned_token_id, ..
        }) => assert_eq!(orphaned_token_id, Some(1)),
        other => panic!("expected a persistence failure, got {:?}", other.map(|o| o.stage())),
    }
    // One write plus one retry
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    let candidates = ["octo".to_string(), "octo_gitee".to_string()];
    assert_eq!(h.raw.username_exists(&candidates).await.unwrap(), vec![false, false]);
    assert!(h.raw.token_ids().await.is_empty());

    // A second login must not fall back to a suffixed username
    let _ = h.callback(&h.begin(None).await).await;
    assert_eq!(h.raw.username_exists(&candidates).await.unwrap(), vec![false, false]);
}

#[tokio::test]
async fn test_failed_bind_to_existing_retries_once() {
    let (h, attempts) = rejecting_harness(ConnectSettings {
        auto_sign_up: false,
        ..ConnectSettings::default()
    })
    .await;

    let outcome = h.callback(&h.begin(None).await).await.unwrap();
    let account = h
        .storage
        .register_from_external(&outcome.profile, "octo", &[])
        .await
        .unwrap();

    let result = h
        .processor
        .resolver()
        .bind_to_existing(&account, &outcome.profile)
        .await;
    assert!(matches!(
        result,
        Err(ConnectError::Persistence {
            orphaned_token_id: Some(1),
            ..
        })
    ));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert!(h.raw.token_ids().await.is_empty());
}
