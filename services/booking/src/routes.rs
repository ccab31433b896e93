use axum::{
    routing::{get, post},
    Router,
};

use crate::{handlers, AppState};

pub fn create_routes() -> Router<AppState> {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))

        // Booking endpoints
        .route("/bookings", post(handlers::create_booking))
        .route("/bookings/:booking_id", get(handlers::get_booking))
}
