use axum::{
    routing::{get, post},
    Router,
};

use crate::{handlers, AppState};

pub fn create_routes() -> Router<AppState> {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))

        // Hold endpoints
        .route("/holds", post(handlers::create_hold))
        .route("/holds/:hold_id", get(handlers::get_hold))
}
