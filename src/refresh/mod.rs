//! Distributed, best-effort refresh of stored provider tokens.

pub mod batch;
pub mod lock;
pub mod scheduler;

pub use batch::{BatchRange, partition};
#[cfg(feature = "redis")]
pub use lock::RedisBatchLock;
pub use lock::{BatchLock, MemoryBatchLock};
pub use scheduler::{RefreshRunSummary, RefreshSettings, TokenRefreshScheduler};
