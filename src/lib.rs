//! social-connect library crate.
//!
//! Links third-party OAuth2 accounts to local identities and keeps the
//! stored provider tokens fresh with a distributed, batch-locked scheduler.

pub mod config;
pub mod connect;
pub mod errors;
pub mod executor;
pub mod http;
pub mod provider;
pub mod refresh;
pub mod state;
pub mod storage;
