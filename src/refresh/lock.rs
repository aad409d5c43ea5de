//! Per-batch locks shared by every node firing the same refresh tick.
//!
//! A run owns one job key (a hash). Each batch index is a field claimed with
//! set-if-absent; whoever sets it first processes that batch. There is no
//! fencing token and no renewal: a lock outliving its holder can only cause a
//! duplicate upstream refresh call.

use crate::errors::RefreshError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[async_trait]
pub trait BatchLock: Send + Sync {
    /// Register this node for the run and set the job key's TTL
    async fn begin_run(&self, job_key: &str, owner: &str, ttl: Duration)
    -> Result<(), RefreshError>;

    /// Claim `batch` for `owner`; false when another node already holds it
    async fn try_acquire(&self, job_key: &str, batch: u64, owner: &str)
    -> Result<bool, RefreshError>;
}

struct JobEntry {
    expires_at: Instant,
    owners: HashMap<u64, String>,
}

/// Process-local lock, for tests and for several schedulers in one process
#[derive(Default)]
pub struct MemoryBatchLock {
    jobs: Mutex<HashMap<String, JobEntry>>,
}

impl MemoryBatchLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Owner recorded for a batch, if any
    pub async fn owner_of(&self, job_key: &str, batch: u64) -> Option<String> {
        let jobs = self.jobs.lock().await;
        jobs.get(job_key)
            .and_then(|job| job.owners.get(&batch))
            .cloned()
    }
}

#[async_trait]
impl BatchLock for MemoryBatchLock {
    async fn begin_run(
        &self,
        job_key: &str,
        _owner: &str,
        ttl: Duration,
    ) -> Result<(), RefreshError> {
        let mut jobs = self.jobs.lock().await;
        let now = Instant::now();
        jobs.retain(|_, job| job.expires_at > now);
        jobs.entry(job_key.to_string())
            .or_insert_with(|| JobEntry {
                expires_at: now + ttl,
                owners: HashMap::new(),
            })
            .expires_at = now + ttl;
        Ok(())
    }

    async fn try_acquire(
        &self,
        job_key: &str,
        batch: u64,
        owner: &str,
    ) -> Result<bool, RefreshError> {
        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs.get_mut(job_key) else {
            return Err(RefreshError::LockUnavailable(format!(
                "run {job_key} was not started"
            )));
        };
        if job.owners.contains_key(&batch) {
            return Ok(false);
        }
        job.owners.insert(batch, owner.to_string());
        Ok(true)
    }
}

#[cfg(feature = "redis")]
pub use redis_lock::RedisBatchLock;

#[cfg(feature = "redis")]
mod redis_lock {
    use super::BatchLock;
    use crate::errors::RefreshError;
    use crate::state::redis_store::pooled_connection;
    use async_trait::async_trait;
    use deadpool_redis::Pool;
    use redis::AsyncCommands;
    use std::time::Duration;

    const RUN_FIELD: &str = "__run";

    /// Redis hash lock using `HSETNX` per batch index
    #[derive(Clone)]
    pub struct RedisBatchLock {
        pool: Pool,
    }

    impl RedisBatchLock {
        pub fn new(pool: Pool) -> Self {
            Self { pool }
        }

        async fn connection(&self) -> Result<deadpool_redis::Connection, RefreshError> {
            pooled_connection(&self.pool)
                .await
                .map_err(|e| RefreshError::LockUnavailable(e.to_string()))
        }
    }

    fn lock_error(e: redis::RedisError) -> RefreshError {
        RefreshError::LockUnavailable(e.to_string())
    }

    #[async_trait]
    impl BatchLock for RedisBatchLock {
        async fn begin_run(
            &self,
            job_key: &str,
            owner: &str,
            ttl: Duration,
        ) -> Result<(), RefreshError> {
            let mut conn = self.connection().await?;
            let _: bool = conn
                .hset_nx(job_key, RUN_FIELD, owner)
                .await
                .map_err(lock_error)?;
            let _: bool = conn
                .expire(job_key, ttl.as_secs().max(1) as i64)
                .await
                .map_err(lock_error)?;
            Ok(())
        }

        async fn try_acquire(
            &self,
            job_key: &str,
            batch: u64,
            owner: &str,
        ) -> Result<bool, RefreshError> {
            let mut conn = self.connection().await?;
            let acquired: bool = conn
                .hset_nx(job_key, batch.to_string(), owner)
                .await
                .map_err(lock_error)?;
            Ok(acquired)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_one_owner_per_batch() {
        let lock = Arc::new(MemoryBatchLock::new());
        let ttl = Duration::from_secs(60);
        lock.begin_run("job:1", "node-a", ttl).await.unwrap();
        lock.begin_run("job:1", "node-b", ttl).await.unwrap();

        assert!(lock.try_acquire("job:1", 0, "node-a").await.unwrap());
        assert!(!lock.try_acquire("job:1", 0, "node-b").await.unwrap());
        assert!(lock.try_acquire("job:1", 1, "node-b").await.unwrap());
        assert_eq!(lock.owner_of("job:1", 0).await.as_deref(), Some("node-a"));

        // A later tick uses a fresh key
        lock.begin_run("job:2", "node-b", ttl).await.unwrap();
        assert!(lock.try_acquire("job:2", 0, "node-b").await.unwrap());
    }

    #[tokio::test]
    async fn test_acquire_without_run_fails() {
        let lock = MemoryBatchLock::new();
        assert!(matches!(
            lock.try_acquire("job:1", 0, "node-a").await,
            Err(RefreshError::LockUnavailable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_key_expires() {
        let lock = MemoryBatchLock::new();
        lock.begin_run("job:1", "a", Duration::from_secs(10))
            .await
            .unwrap();
        assert!(lock.try_acquire("job:1", 0, "a").await.unwrap());

        tokio::time::advance(Duration::from_secs(11)).await;
        lock.begin_run("job:1", "b", Duration::from_secs(10))
            .await
            .unwrap();
        assert!(lock.try_acquire("job:1", 0, "b").await.unwrap());
    }
}
