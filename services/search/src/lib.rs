pub mod config;
pub mod consumers;
pub mod handlers;
pub mod index;
pub mod models;
pub mod routes;
pub mod service;

use std::sync::Arc;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::service::SearchService;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<SearchService>,
}

pub fn create_router(state: AppState) -> Router {
    routes::create_routes()
        .fallback(handlers::handler_404)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
