use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use karigo_auth::require_internal_key;

use crate::{handlers, AppState};

pub fn create_routes(state: &AppState) -> Router<AppState> {
    // Service-to-service endpoints
    let internal = Router::new()
        .route("/payments/fail", post(handlers::fail_payment))
        .route("/payments/:booking_id", get(handlers::get_payment))
        .route("/payments/:booking_id/events", get(handlers::get_payment_events))
        .route("/payments/invoices/:payer_id", get(handlers::get_invoice))
        .route("/payments/invoices/:payer_id/csv", get(handlers::export_invoice_csv))
        .route_layer(middleware::from_fn_with_state(
            state.internal_key.clone(),
            require_internal_key,
        ));

    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))

        // Payment endpoints
        .route("/payments/capture", post(handlers::capture_payment))
        .route("/payments/refund", post(handlers::refund_payment))

        // Development shortcut
        .route("/mock-capture", post(handlers::mock_capture))

        // Provider webhooks (signature checked in the handler)
        .route("/webhooks", post(handlers::handle_webhook))

        .merge(internal)
}
