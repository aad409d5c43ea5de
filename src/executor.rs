//! Bounded task pool that never drops work.
//!
//! Submissions run on a spawned task while a permit is free. When the pool is
//! saturated the submitter awaits the future itself, which also throttles the
//! producer.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;

#[derive(Clone)]
pub struct BoundedExecutor {
    name: &'static str,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl BoundedExecutor {
    pub fn new(name: &'static str, size: usize) -> Self {
        Self {
            name,
            permits: Arc::new(Semaphore::new(size.max(1))),
            tracker: TaskTracker::new(),
        }
    }

    /// Run `task` on the pool, or inline on the caller when every worker is busy.
    pub async fn submit<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self.permits.clone().try_acquire_owned() {
            Ok(permit) => {
                self.tracker.spawn(async move {
                    task.await;
                    drop(permit);
                });
            }
            Err(_) => {
                tracing::debug!(pool = self.name, "pool saturated, running task on caller");
                task.await;
            }
        }
    }

    /// Wait for every spawned task to finish. The pool accepts new work afterwards.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_every_task_runs() {
        let executor = BoundedExecutor::new("test", 2);
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..20 {
            let done = done.clone();
            executor
                .submit(async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    done.fetch_add(1, Ordering::SeqCst);
                })
                .await;
        }
        executor.drain().await;

        assert_eq!(done.load(Ordering::SeqCst), 20);
        assert_eq!(executor.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_saturated_pool_runs_on_caller() {
        let executor = BoundedExecutor::new("test", 1);
        let (release, blocked) = tokio::sync::oneshot::channel::<()>();

        executor
            .submit(async move {
                let _ = blocked.await;
            })
            .await;

        // The only worker is parked, so this completes inline before submit returns
        let ran_inline = Arc::new(AtomicUsize::new(0));
        let flag = ran_inline.clone();
        executor
            .submit(async move {
                flag.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        assert_eq!(ran_inline.load(Ordering::SeqCst), 1);

        let _ = release.send(());
        executor.drain().await;
    }
}
