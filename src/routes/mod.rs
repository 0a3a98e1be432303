//! Route modules for Dropgate Server

pub mod files;
pub mod health;
pub mod upload;

use axum::{middleware, routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::admission::admission_middleware;
use crate::state::AppState;

/// Build the full application router.
///
/// Every request passes the HTTP admission pool before reaching a handler.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(Any);

    let api = files::router().merge(upload::router());

    Router::new()
        .route("/health", get(health::health_check))
        .nest("/api", api)
        .layer(middleware::from_fn_with_state(
            state.http_pool().clone(),
            admission_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
