pub mod config;
pub mod consumers;
pub mod handlers;
pub mod idempotency;
pub mod invoices;
pub mod models;
pub mod postgres;
pub mod routes;
pub mod service;
pub mod store;
pub mod velocity;

use std::sync::Arc;

use axum::Router;
use tower_http::trace::TraceLayer;

use karigo_auth::InternalKey;

use crate::service::PaymentService;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<PaymentService>,
    pub internal_key: InternalKey,
}

/// The service's HTTP surface, with tracing and the JSON 404 fallback.
pub fn create_router(state: AppState) -> Router {
    routes::create_routes(&state)
        .fallback(handlers::handler_404)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
