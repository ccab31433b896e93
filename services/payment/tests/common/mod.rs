#![allow(dead_code)]

use std::sync::Arc;

use axum_test::TestServer;
use uuid::Uuid;

use karigo_auth::InternalKey;
use karigo_common::{InMemoryEventBus, OutboxConfig};
use karigo_database::{InMemoryOutboxStore, OutboxRelay, RelayReport};
use karigo_payment::config::PaymentServiceConfig;
use karigo_payment::idempotency::InMemoryIdempotencyStore;
use karigo_payment::models::{CaptureRequest, RefundRequest};
use karigo_payment::service::PaymentService;
use karigo_payment::store::InMemoryPaymentStore;
use karigo_payment::{create_router, AppState};

pub const INTERNAL_KEY: &str = "test-internal-key";

pub struct Harness {
    pub service: Arc<PaymentService>,
    pub store: Arc<InMemoryPaymentStore>,
    pub outbox: Arc<InMemoryOutboxStore>,
    pub bus: Arc<InMemoryEventBus>,
    relay: OutboxRelay,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(PaymentServiceConfig::default())
    }

    pub fn with_config(config: PaymentServiceConfig) -> Self {
        let outbox = Arc::new(InMemoryOutboxStore::new());
        let store = Arc::new(InMemoryPaymentStore::new(outbox.clone()));
        let bus = Arc::new(InMemoryEventBus::new());
        let service = Arc::new(PaymentService::new(
            store.clone(),
            Arc::new(InMemoryIdempotencyStore::new()),
            bus.clone(),
            config,
        ));
        let relay = OutboxRelay::new(
            outbox.clone(),
            bus.clone(),
            OutboxConfig {
                poll_interval_ms: 10,
                batch_size: 100,
            },
        );

        Self {
            service,
            store,
            outbox,
            bus,
            relay,
        }
    }

    /// Publishes everything waiting in the outbox.
    pub async fn flush(&self) -> RelayReport {
        self.relay.process_batch().await.unwrap()
    }

    pub fn server(&self) -> TestServer {
        let state = AppState {
            service: self.service.clone(),
            internal_key: InternalKey::new(INTERNAL_KEY),
        };
        TestServer::new(create_router(state)).unwrap()
    }
}

pub fn capture(booking_id: Uuid, amount: i64) -> CaptureRequest {
    CaptureRequest {
        booking_id,
        amount,
        currency: Some("EUR".to_string()),
        payer_id: None,
        payment_method_type: Some("card".to_string()),
        payment_method_id: Some("pm_123".to_string()),
        payment_provider: Some("stripe".to_string()),
    }
}

pub fn capture_for(payer_id: Uuid, booking_id: Uuid, amount: i64) -> CaptureRequest {
    CaptureRequest {
        payer_id: Some(payer_id),
        ..capture(booking_id, amount)
    }
}

pub fn refund(booking_id: Uuid, amount: i64) -> RefundRequest {
    RefundRequest {
        booking_id,
        amount,
        payer_id: None,
        reason: Some("trip cancelled".to_string()),
    }
}
