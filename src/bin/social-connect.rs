//! social-connect server binary.
//!
//! Wires configuration, storage, state stores and provider clients together,
//! then runs the HTTP server and the token refresh scheduler until shutdown.

use anyhow::Result;
use social_connect::{
    config::Config,
    connect::{AuthorizationInitiator, CallbackProcessor, IdentityResolver},
    errors::StorageError,
    executor::BoundedExecutor,
    http::{AppState, build_router},
    provider::ProviderRegistry,
    refresh::{BatchLock, TokenRefreshScheduler},
    state::{
        AuthorizationContextStore, MemoryAuthorizationContextStore, MemoryStateCache,
        RedirectStateCoder, StateCache, StateCoder,
    },
    storage::{
        ConnectStorage, EncryptedStorage, TokenCipher, create_storage_backend,
        parse_storage_backend,
    },
};
use std::{env, sync::Arc};

use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing_subscriber::prelude::*;

type SharedStores = (
    Arc<dyn StateCache>,
    Arc<dyn AuthorizationContextStore>,
    Option<Arc<dyn BatchLock>>,
);

#[cfg(feature = "redis")]
const REDIS_KEY_PREFIX: &str = "social-connect";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "social_connect=debug,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().pretty())
        .init();

    let version = social_connect::config::version()?;

    env::args().for_each(|arg| {
        if arg == "--version" {
            println!("{version}");
            std::process::exit(0);
        }
    });

    tracing::info!(?version, "Starting social-connect");

    let config = Config::new()?;

    let registry = Arc::new(ProviderRegistry::from_configs(config.provider_configs()?)?);
    if registry.is_empty() {
        tracing::warn!("no providers configured, set CONNECT_PROVIDERS");
    }

    let storage_backend =
        parse_storage_backend(&config.storage_backend, config.database_url.as_deref())?;
    let storage = create_storage_backend(storage_backend)
        .await
        .map_err(|e| StorageError::DatabaseError(format!("Storage backend creation failed: {}", e)))?;
    let storage: Arc<dyn ConnectStorage> = Arc::new(EncryptedStorage::new(
        storage,
        TokenCipher::new(&config.token_encryption_secret),
    ));

    let (state_cache, contexts, batch_lock) = shared_stores(&config)?;

    let coder: Option<Arc<dyn StateCoder>> = if *config.state_redirect_coder.as_ref() {
        Some(Arc::new(RedirectStateCoder))
    } else {
        None
    };

    let connect_settings = Arc::new(config.connect_settings());
    let resolver = Arc::new(IdentityResolver::new(
        storage.clone(),
        BoundedExecutor::new("binding", *config.binding_pool_size.as_ref()),
        connect_settings.clone(),
    ));

    let app_context = AppState {
        version: version.clone(),
        registry: registry.clone(),
        initiator: Arc::new(AuthorizationInitiator::new(
            registry.clone(),
            state_cache.clone(),
            contexts.clone(),
            coder.clone(),
            connect_settings.clone(),
        )),
        processor: Arc::new(CallbackProcessor::new(
            registry.clone(),
            state_cache,
            contexts,
            coder,
            resolver,
            connect_settings,
        )),
    };

    let app = build_router(app_context);

    let scheduler = Arc::new(TokenRefreshScheduler::new(
        storage,
        registry,
        batch_lock,
        Arc::new(config.refresh_settings()),
    ));

    // Setup graceful shutdown
    let tracker = TaskTracker::new();
    let token = CancellationToken::new();

    {
        let tracker = tracker.clone();
        let inner_token = token.clone();

        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::spawn(async move {
            tokio::select! {
                () = inner_token.cancelled() => { },
                _ = terminate => {},
                _ = ctrl_c => {},
            }

            tracker.close();
            inner_token.cancel();
        });
    }

    // Start refresh scheduler
    {
        let inner_token = token.clone();
        tracing::info!(node_id = scheduler.node_id(), "Starting token refresh scheduler");
        tracker.spawn(scheduler.run(inner_token));
    }

    // Start HTTP server
    {
        let http_port = *config.http_port.as_ref();
        let bind_address = format!("0.0.0.0:{http_port}");
        let listener = TcpListener::bind(&bind_address).await?;
        tracing::info!("Starting server on {bind_address}");

        let inner_token = token.clone();
        tracker.spawn(async move {
            let shutdown_token = inner_token.clone();
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown_token.cancelled().await;
                    tracing::info!("axum graceful shutdown complete");
                })
                .await;
            if let Err(err) = result {
                tracing::error!("axum task failed: {}", err);
            }

            inner_token.cancel();
        });
    }

    tracker.wait().await;

    Ok(())
}

/// Redis-backed stores and batch lock when `REDIS_URL` is set, process-local otherwise
#[cfg(feature = "redis")]
fn shared_stores(config: &Config) -> Result<SharedStores> {
    use social_connect::refresh::RedisBatchLock;
    use social_connect::state::{
        RedisAuthorizationContextStore, RedisStateCache, create_redis_pool,
    };

    let Some(redis_url) = config.redis_url.as_deref() else {
        return Ok(local_stores());
    };

    let pool = create_redis_pool(redis_url)?;
    tracing::info!("Using Redis for state and batch locks");
    Ok((
        Arc::new(RedisStateCache::new(pool.clone(), REDIS_KEY_PREFIX)),
        Arc::new(RedisAuthorizationContextStore::new(pool.clone(), REDIS_KEY_PREFIX)),
        Some(Arc::new(RedisBatchLock::new(pool))),
    ))
}

#[cfg(not(feature = "redis"))]
fn shared_stores(config: &Config) -> Result<SharedStores> {
    if config.redis_url.is_some() {
        tracing::warn!("REDIS_URL is set but the redis feature is disabled");
    }
    Ok(local_stores())
}

// Without a shared cache every batch is refreshed by this node.
fn local_stores() -> SharedStores {
    (
        Arc::new(MemoryStateCache::new()),
        Arc::new(MemoryAuthorizationContextStore::new()),
        None,
    )
}
