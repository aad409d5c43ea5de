//! Scheduled refresh of provider tokens that are about to expire.

use super::batch::{BatchRange, partition};
use super::lock::BatchLock;
use crate::errors::RefreshError;
use crate::executor::BoundedExecutor;
use crate::provider::{ProviderClient, ProviderRegistry};
use crate::storage::traits::{ConnectStorage, TokenRecord};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
#[cfg_attr(any(debug_assertions, test), derive(Debug))]
pub struct RefreshSettings {
    /// Token table support; the scheduler is a no-op when off
    pub enabled: bool,
    pub schedule: cron::Schedule,
    pub batch_count: i64,
    pub remaining_window: Duration,
    pub pool_size: usize,
    pub lock_ttl: Duration,
    pub lock_key_prefix: String,
}

impl RefreshSettings {
    /// Job key shared by every node firing at `fire_time`
    pub fn job_key(&self, fire_time: DateTime<Utc>) -> String {
        format!("{}:{}", self.lock_key_prefix, fire_time.timestamp())
    }
}

/// Counters for one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshRunSummary {
    pub batches_total: u64,
    pub batches_processed: u64,
    pub batches_skipped: u64,
    /// Batches whose rows could not be loaded
    pub batches_failed: u64,
    pub refreshed: u64,
    pub unsupported: u64,
    pub failed: u64,
}

#[derive(Default)]
struct RowCounters {
    refreshed: AtomicU64,
    unsupported: AtomicU64,
    failed: AtomicU64,
}

pub struct TokenRefreshScheduler {
    storage: Arc<dyn ConnectStorage>,
    registry: Arc<ProviderRegistry>,
    lock: Option<Arc<dyn BatchLock>>,
    settings: Arc<RefreshSettings>,
    executor: BoundedExecutor,
    node_id: String,
}

impl TokenRefreshScheduler {
    /// Without a lock every batch is processed by this node.
    pub fn new(
        storage: Arc<dyn ConnectStorage>,
        registry: Arc<ProviderRegistry>,
        lock: Option<Arc<dyn BatchLock>>,
        settings: Arc<RefreshSettings>,
    ) -> Self {
        let executor = BoundedExecutor::new("token-refresh", settings.pool_size);
        Self {
            storage,
            registry,
            lock,
            settings,
            executor,
            node_id: ulid::Ulid::new().to_string(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Fire on every cron tick until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if !self.settings.enabled {
            tracing::info!("token table disabled, refresh scheduler not started");
            return;
        }

        loop {
            let Some(fire_time) = self.settings.schedule.upcoming(Utc).next() else {
                tracing::warn!("refresh schedule has no upcoming fire time");
                return;
            };
            let wait = (fire_time - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tracing::debug!(%fire_time, "next token refresh scheduled");

            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("refresh scheduler stopping");
                    return;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            match self.run_once(fire_time).await {
                Ok(summary) => tracing::info!(?summary, "token refresh run finished"),
                Err(e) => tracing::error!(error = ?e, "token refresh run aborted"),
            }
        }
    }

    /// Process every batch for the tick at `fire_time`. Only a lock failure aborts the run.
    pub async fn run_once(
        &self,
        fire_time: DateTime<Utc>,
    ) -> Result<RefreshRunSummary, RefreshError> {
        let mut summary = RefreshRunSummary::default();
        if !self.settings.enabled {
            return Ok(summary);
        }

        let max_token_id = self
            .storage
            .max_token_id()
            .await
            .map_err(|e| RefreshError::Transient(e.to_string()))?;
        let batches = partition(max_token_id, self.settings.batch_count);
        summary.batches_total = batches.len() as u64;

        let deadline = fire_time.timestamp_millis()
            + i64::try_from(self.settings.remaining_window.as_millis()).unwrap_or(i64::MAX / 2);
        let job_key = self.settings.job_key(fire_time);

        if let Some(lock) = &self.lock {
            lock.begin_run(&job_key, &self.node_id, self.settings.lock_ttl)
                .await?;
        }

        let counters = Arc::new(RowCounters::default());
        let result = self
            .process_batches(&batches, &job_key, deadline, &counters, &mut summary)
            .await;

        // Tasks already submitted still finish and count
        self.executor.drain().await;
        summary.refreshed = counters.refreshed.load(Ordering::Relaxed);
        summary.unsupported = counters.unsupported.load(Ordering::Relaxed);
        summary.failed = counters.failed.load(Ordering::Relaxed);

        result.map(|_| summary)
    }

    async fn process_batches(
        &self,
        batches: &[BatchRange],
        job_key: &str,
        deadline: i64,
        counters: &Arc<RowCounters>,
        summary: &mut RefreshRunSummary,
    ) -> Result<(), RefreshError> {
        for batch in batches {
            if let Some(lock) = &self.lock {
                if !lock.try_acquire(job_key, batch.index, &self.node_id).await? {
                    tracing::debug!(batch = batch.index, "batch owned by another node, skipping");
                    summary.batches_skipped += 1;
                    continue;
                }
            }

            match self
                .storage
                .find_expiring_tokens(batch.start_id, batch.end_id, deadline)
                .await
            {
                Ok(tokens) => {
                    tracing::debug!(
                        batch = batch.index,
                        start_id = batch.start_id,
                        end_id = batch.end_id,
                        count = tokens.len(),
                        "processing refresh batch"
                    );
                    for token in tokens {
                        self.submit(token, counters.clone()).await;
                    }
                    summary.batches_processed += 1;
                }
                Err(e) => {
                    tracing::warn!(batch = batch.index, error = ?e, "failed to load refresh batch");
                    summary.batches_failed += 1;
                }
            }
        }
        Ok(())
    }

    async fn submit(&self, token: TokenRecord, counters: Arc<RowCounters>) {
        let Some(client) = self.registry.resolve(&token.provider_id) else {
            tracing::warn!(
                token_id = token.id,
                provider_id = %token.provider_id,
                "no provider configured for token, leaving it for a later run"
            );
            counters.failed.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let storage = self.storage.clone();
        self.executor
            .submit(async move {
                refresh_one(storage.as_ref(), client.as_ref(), token, &counters).await;
            })
            .await;
    }
}

async fn refresh_one(
    storage: &dyn ConnectStorage,
    client: &dyn ProviderClient,
    token: TokenRecord,
    counters: &RowCounters,
) {
    match client.refresh_token(&token).await {
        Ok(refreshed) => {
            let refreshed = TokenRecord {
                id: token.id,
                provider_id: token.provider_id.clone(),
                ..refreshed
            };
            match storage.persist_refreshed_token(&refreshed).await {
                Ok(()) => {
                    tracing::debug!(token_id = token.id, "token refreshed");
                    counters.refreshed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    tracing::warn!(token_id = token.id, error = ?e, "failed to store refreshed token");
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Err(RefreshError::Unsupported(provider_id)) => {
            match storage.disable_refresh(token.id).await {
                Ok(()) => {
                    tracing::info!(token_id = token.id, %provider_id, "refresh unsupported, disabled for token");
                    counters.unsupported.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    tracing::warn!(token_id = token.id, error = ?e, "failed to disable refresh");
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Err(e) => {
            tracing::warn!(token_id = token.id, provider_id = %token.provider_id, error = ?e, "token refresh failed");
            counters.failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ConnectError;
    use crate::provider::{ExternalProfile, ProviderToken};
    use crate::refresh::lock::MemoryBatchLock;
    use crate::storage::inmemory::MemoryConnectStorage;
    use crate::storage::traits::{NEVER_EXPIRES, TokenStore};
    use async_trait::async_trait;
    use std::str::FromStr;

    struct CountingProvider {
        id: &'static str,
        calls: AtomicU64,
        outcome: fn() -> Result<(), RefreshError>,
    }

    #[async_trait]
    impl ProviderClient for CountingProvider {
        fn provider_id(&self) -> &str {
            self.id
        }

        fn authorize_url(&self, _state: &str) -> Result<String, ConnectError> {
            Ok(String::new())
        }

        async fn exchange_token(&self, _code: &str) -> Result<ProviderToken, ConnectError> {
            Err(ConnectError::ProviderProtocol("unused".to_string()))
        }

        async fn fetch_user_info(
            &self,
            _token: &ProviderToken,
        ) -> Result<ExternalProfile, ConnectError> {
            Err(ConnectError::ProviderProtocol("unused".to_string()))
        }

        async fn refresh_token(&self, token: &TokenRecord) -> Result<TokenRecord, RefreshError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.outcome)()?;
            Ok(TokenRecord {
                access_token: format!("{}-refreshed", token.access_token),
                expire_time: token.expire_time + 1_000_000_000,
                ..token.clone()
            })
        }
    }

    fn settings(batch_count: i64) -> Arc<RefreshSettings> {
        Arc::new(RefreshSettings {
            enabled: true,
            schedule: cron::Schedule::from_str("0 0 2 * * *").unwrap(),
            batch_count,
            remaining_window: Duration::from_secs(24 * 3600),
            pool_size: 4,
            lock_ttl: Duration::from_secs(6 * 3600),
            lock_key_prefix: "test:refresh".to_string(),
        })
    }

    async fn seed(storage: &MemoryConnectStorage, provider_id: &str, expire_time: i64) -> i64 {
        storage
            .insert_token(&TokenRecord {
                id: 0,
                provider_id: provider_id.to_string(),
                access_token: "access".to_string(),
                refresh_token: Some("refresh".to_string()),
                token_type: None,
                scope: None,
                expire_time,
                enable_refresh: true,
                updated_at: Utc::now(),
            })
            .await
            .unwrap()
    }

    fn provider(outcome: fn() -> Result<(), RefreshError>) -> Arc<CountingProvider> {
        Arc::new(CountingProvider {
            id: "gitee",
            calls: AtomicU64::new(0),
            outcome,
        })
    }

    fn scheduler(
        storage: Arc<MemoryConnectStorage>,
        provider: Arc<CountingProvider>,
        lock: Option<Arc<dyn BatchLock>>,
        batch_count: i64,
    ) -> TokenRefreshScheduler {
        let registry = ProviderRegistry::from_clients([provider as Arc<dyn ProviderClient>]);
        TokenRefreshScheduler::new(storage, Arc::new(registry), lock, settings(batch_count))
    }

    #[tokio::test]
    async fn test_single_node_refreshes_stale_tokens_only() {
        let storage = Arc::new(MemoryConnectStorage::new());
        let now = Utc::now();
        let stale = seed(&storage, "gitee", now.timestamp_millis() + 1_000).await;
        let fresh = seed(&storage, "gitee", now.timestamp_millis() + 48 * 3600 * 1000).await;
        let never = seed(&storage, "gitee", NEVER_EXPIRES).await;

        let provider = provider(|| Ok(()));
        let scheduler = scheduler(storage.clone(), provider.clone(), None, 2);
        let summary = scheduler.run_once(now).await.unwrap();

        assert_eq!(summary.batches_total, 2);
        assert_eq!(summary.batches_processed, 2);
        assert_eq!(summary.refreshed, 1);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            storage.get_token(stale).await.unwrap().unwrap().access_token,
            "access-refreshed"
        );
        assert_eq!(storage.get_token(fresh).await.unwrap().unwrap().access_token, "access");
        assert_eq!(storage.get_token(never).await.unwrap().unwrap().access_token, "access");
    }

    #[tokio::test]
    async fn test_transient_failure_leaves_token_for_next_run() {
        let storage = Arc::new(MemoryConnectStorage::new());
        let now = Utc::now();
        let id = seed(&storage, "gitee", now.timestamp_millis()).await;

        let provider = provider(|| Err(RefreshError::Transient("503".to_string())));
        let scheduler = scheduler(storage.clone(), provider.clone(), None, 10);

        let summary = scheduler.run_once(now).await.unwrap();
        assert_eq!(summary.failed, 1);
        let summary = scheduler.run_once(now).await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);

        let token = storage.get_token(id).await.unwrap().unwrap();
        assert!(token.enable_refresh);
        assert_eq!(token.access_token, "access");
    }

    #[tokio::test]
    async fn test_disabled_is_noop() {
        let storage = Arc::new(MemoryConnectStorage::new());
        seed(&storage, "gitee", 0).await;
        let provider = provider(|| Ok(()));
        let registry = ProviderRegistry::from_clients([provider.clone() as Arc<dyn ProviderClient>]);
        let mut disabled = (*settings(10)).clone();
        disabled.enabled = false;
        let scheduler =
            TokenRefreshScheduler::new(storage, Arc::new(registry), None, Arc::new(disabled));

        assert_eq!(
            scheduler.run_once(Utc::now()).await.unwrap(),
            RefreshRunSummary::default()
        );
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_provider_counts_as_failed() {
        let storage = Arc::new(MemoryConnectStorage::new());
        let now = Utc::now();
        seed(&storage, "gitlab", now.timestamp_millis()).await;
        let scheduler = scheduler(storage, provider(|| Ok(())), None, 10);

        let summary = scheduler.run_once(now).await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.refreshed, 0);
    }

    #[tokio::test]
    async fn test_lock_key_namespaced_by_fire_time() {
        let settings = settings(10);
        let fire_time = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        assert_eq!(settings.job_key(fire_time), "test:refresh:1700000000");

        let storage = Arc::new(MemoryConnectStorage::new());
        seed(&storage, "gitee", 0).await;
        let lock = Arc::new(MemoryBatchLock::new());
        let scheduler = scheduler(
            storage,
            provider(|| Ok(())),
            Some(lock.clone() as Arc<dyn BatchLock>),
            10,
        );
        scheduler.run_once(fire_time).await.unwrap();
        assert_eq!(
            lock.owner_of("test:refresh:1700000000", 0).await.as_deref(),
            Some(scheduler.node_id())
        );
    }
}
