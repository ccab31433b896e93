use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use karigo_auth::require_internal_key;

use crate::{handlers, AppState};

pub fn create_routes(state: &AppState) -> Router<AppState> {
    // Seat locks are only taken by the booking service
    let internal = Router::new()
        .route("/rides/:ride_id/lock", post(handlers::lock_seats))
        .route("/rides/:ride_id/unlock", post(handlers::unlock_seats))
        .route_layer(middleware::from_fn_with_state(
            state.internal_key.clone(),
            require_internal_key,
        ));

    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))

        // Ride endpoints
        .route("/rides", post(handlers::create_ride))
        .route("/rides/:ride_id", get(handlers::get_ride))
        .route("/rides/:ride_id/publish", post(handlers::publish_ride))

        .merge(internal)
}
