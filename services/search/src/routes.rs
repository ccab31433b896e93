use axum::{routing::get, Router};

use crate::{handlers, AppState};

pub fn create_routes() -> Router<AppState> {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))

        // Search endpoints
        .route("/search", get(handlers::search_rides))
}
