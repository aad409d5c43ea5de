//! In-memory storage implementations
//!
//! Suitable for development, tests and single-node deployments that can
//! afford to lose bindings on restart.

mod connect;

pub use connect::MemoryConnectStorage;
