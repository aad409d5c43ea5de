//! Axum HTTP surface for the authorization round trip.

pub mod context;
mod handler_authorize;
mod handler_callback;
mod handler_index;
pub mod server;

pub use context::AppState;
pub use handler_callback::LoginResponse;
pub use server::build_router;
