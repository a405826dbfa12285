use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};

use crate::coordinator::Coordinator;

pub mod error;
pub mod lookup;
pub mod refresh;

/// Shared application state available to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
}

impl AppState {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }
}

/// Build the main application router with all API routes.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_v1 = Router::new()
        // Health check
        .route("/health", get(health))
        // Vendor lookup
        .route("/lookup/:address", get(lookup::get_one))
        // Reference data
        .route("/status", get(refresh::status))
        .route("/refresh", post(refresh::trigger));

    Router::new()
        .nest("/api/v1", api_v1)
        .layer(cors)
        .with_state(state)
}

/// Simple health check endpoint.
async fn health() -> &'static str {
    "ok"
}
