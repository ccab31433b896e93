use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum_test::TestServer;
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use karigo_common::events::{topics, DomainEvent, EventEnvelope, PaymentCaptured, PaymentFailed};
use karigo_common::{publish_event, ApiError, ApiResponse, ErrorCode, InMemoryEventBus, RetryPolicy};
use karigo_wallet::consumers;
use karigo_wallet::models::{CreateHoldRequest, HoldStatus, WalletHold};
use karigo_wallet::service::WalletService;
use karigo_wallet::store::InMemoryHoldStore;
use karigo_wallet::{create_router, AppState};

struct Harness {
    service: Arc<WalletService>,
    store: Arc<InMemoryHoldStore>,
    bus: Arc<InMemoryEventBus>,
}

impl Harness {
    async fn new() -> Self {
        let store = Arc::new(InMemoryHoldStore::new());
        let service = Arc::new(WalletService::new(store.clone(), "EUR"));
        let bus = Arc::new(InMemoryEventBus::new());
        let subscriptions = consumers::subscribe_all(
            bus.clone(),
            service.clone(),
            RetryPolicy::new(1, Duration::from_millis(1)),
        )
        .await
        .unwrap();
        assert_eq!(subscriptions.len(), 2);
        Self { service, store, bus }
    }

    async fn hold(&self, booking_id: Uuid) -> WalletHold {
        self.service
            .create_hold(CreateHoldRequest {
                user_id: Uuid::new_v4(),
                booking_id,
                amount: 1800,
                currency: None,
            })
            .await
            .unwrap()
    }

    async fn deliver(&self, envelope: &EventEnvelope) {
        publish_event(self.bus.as_ref(), envelope).await.unwrap();
    }
}

fn captured(booking_id: Uuid, hold_id: Option<Uuid>) -> EventEnvelope {
    EventEnvelope::new(
        "payment-service",
        DomainEvent::PaymentCaptured(PaymentCaptured {
            intent_id: Some(Uuid::new_v4()),
            booking_id,
            payer_id: None,
            amount: 1800,
            currency: "EUR".to_string(),
            payment_method_type: Some("wallet".to_string()),
            payment_method_id: hold_id.map(|id| id.to_string()),
            payment_provider: None,
            hold_id,
            captured_at: Utc::now(),
        }),
    )
}

fn failed(booking_id: Uuid) -> EventEnvelope {
    EventEnvelope::new(
        "payment-service",
        DomainEvent::PaymentFailed(PaymentFailed {
            intent_id: None,
            booking_id,
            payer_id: None,
            reason: "card declined".to_string(),
            failed_at: Utc::now(),
        }),
    )
}

#[tokio::test]
async fn capture_settles_the_hold_exactly_once() {
    let harness = Harness::new().await;
    let booking_id = Uuid::new_v4();
    let hold = harness.hold(booking_id).await;
    let event = captured(booking_id, Some(hold.id));

    harness.deliver(&event).await;
    let writes_after_first = harness.store.writes();
    harness.deliver(&event).await;

    let stored = harness.service.get_hold(hold.id).await.unwrap();
    assert_eq!(stored.status, HoldStatus::Captured);
    assert!(stored.captured_at.is_some());
    // The redelivery must not write again.
    assert_eq!(harness.store.writes(), writes_after_first);
    assert_eq!(writes_after_first, 2);
}

#[tokio::test]
async fn captures_for_unknown_or_missing_holds_are_noops() {
    let harness = Harness::new().await;

    harness.deliver(&captured(Uuid::new_v4(), Some(Uuid::new_v4()))).await;
    harness.deliver(&captured(Uuid::new_v4(), None)).await;

    assert_eq!(harness.store.writes(), 0);
    assert_eq!(harness.bus.count(&topics::dead_letter(topics::PAYMENT_CAPTURED)), 0);
}

#[tokio::test]
async fn captures_cannot_settle_another_bookings_hold() {
    let harness = Harness::new().await;
    let booking_a = Uuid::new_v4();
    let hold = harness.hold(booking_a).await;

    harness.deliver(&captured(Uuid::new_v4(), Some(hold.id))).await;

    let stored = harness.service.get_hold(hold.id).await.unwrap();
    assert_eq!(stored.status, HoldStatus::Held);
    assert!(stored.captured_at.is_none());
    assert_eq!(harness.store.writes(), 1);
    assert_eq!(harness.bus.count(&topics::dead_letter(topics::PAYMENT_CAPTURED)), 0);

    harness.deliver(&captured(booking_a, Some(hold.id))).await;
    let stored = harness.service.get_hold(hold.id).await.unwrap();
    assert_eq!(stored.status, HoldStatus::Captured);
}

#[tokio::test]
async fn failed_payment_releases_held_holds_only() {
    let harness = Harness::new().await;
    let booking_id = Uuid::new_v4();
    let held = harness.hold(booking_id).await;
    let settled = harness.hold(booking_id).await;
    harness.deliver(&captured(booking_id, Some(settled.id))).await;

    harness.deliver(&failed(booking_id)).await;
    harness.deliver(&failed(booking_id)).await;

    let held = harness.service.get_hold(held.id).await.unwrap();
    let settled = harness.service.get_hold(settled.id).await.unwrap();
    assert_eq!(held.status, HoldStatus::Released);
    assert!(held.released_at.is_some());
    assert_eq!(settled.status, HoldStatus::Captured);
}

#[tokio::test]
async fn released_holds_cannot_be_captured() {
    let harness = Harness::new().await;
    let booking_id = Uuid::new_v4();
    let hold = harness.hold(booking_id).await;

    harness.deliver(&failed(booking_id)).await;
    harness.deliver(&captured(booking_id, Some(hold.id))).await;

    let stored = harness.service.get_hold(hold.id).await.unwrap();
    assert_eq!(stored.status, HoldStatus::Released);
}

#[tokio::test]
async fn holds_are_served_over_http() {
    let harness = Harness::new().await;
    let server = TestServer::new(create_router(AppState {
        service: harness.service.clone(),
    }))
    .unwrap();

    let response = server
        .post("/holds")
        .json(&json!({
            "userId": Uuid::new_v4(),
            "bookingId": Uuid::new_v4(),
            "amount": 900,
            "currency": "eur"
        }))
        .await;
    response.assert_status(StatusCode::CREATED);
    let created: ApiResponse<WalletHold> = response.json();
    let created = created.data.unwrap();
    assert_eq!(created.status, HoldStatus::Held);
    assert_eq!(created.currency, "EUR");

    let fetched: ApiResponse<WalletHold> = server.get(&format!("/holds/{}", created.id)).await.json();
    assert_eq!(fetched.data.map(|h| h.amount), Some(900));

    let response = server
        .get(&format!("/holds/{}", Uuid::new_v4()))
        .expect_failure()
        .await;
    response.assert_status(StatusCode::NOT_FOUND);
    let error: ApiError = response.json();
    assert_eq!(error.error_code, ErrorCode::HoldNotFound.as_str());

    server
        .post("/holds")
        .json(&json!({ "userId": Uuid::new_v4(), "bookingId": Uuid::new_v4(), "amount": 0 }))
        .expect_failure()
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}
