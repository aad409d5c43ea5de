//! Main router configuration assembling the login endpoints.

use axum::{Router, routing::get};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::{
    context::AppState, handler_authorize::handle_authorize, handler_callback::handle_callback,
    handler_index::handle_index,
};

/// Build the application router
pub fn build_router(ctx: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET, axum::http::Method::OPTIONS])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::ACCEPT,
        ]);

    Router::new()
        .route("/", get(handle_index))
        .route("/authorize/{provider_id}", get(handle_authorize))
        .route("/callback/{provider_id}", get(handle_callback))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}
