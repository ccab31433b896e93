pub mod config;
pub mod handlers;
pub mod models;
pub mod postgres;
pub mod routes;
pub mod service;
pub mod store;

use std::sync::Arc;

use axum::Router;
use tower_http::trace::TraceLayer;

use karigo_auth::InternalKey;

use crate::service::RideService;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<RideService>,
    pub internal_key: InternalKey,
}

pub fn create_router(state: AppState) -> Router {
    routes::create_routes(&state)
        .fallback(handlers::handler_404)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
