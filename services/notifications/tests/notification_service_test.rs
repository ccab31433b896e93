use std::sync::Arc;
use std::time::Duration;

use axum_test::TestServer;
use chrono::Utc;
use uuid::Uuid;

use karigo_common::events::{topics, DomainEvent, EventEnvelope, PaymentCaptured, PaymentFailed, PaymentRefunded};
use karigo_common::{publish_event, InMemoryDedupStore, InMemoryEventBus, RetryPolicy};
use karigo_notifications::consumers;
use karigo_notifications::models::NotificationKind;
use karigo_notifications::notifier::InMemoryNotifier;
use karigo_notifications::service::NotificationService;
use karigo_notifications::templates::TemplateEngine;
use karigo_notifications::{create_router, AppState};

struct Harness {
    service: Arc<NotificationService>,
    notifier: Arc<InMemoryNotifier>,
    dedup: Arc<InMemoryDedupStore>,
    bus: Arc<InMemoryEventBus>,
}

impl Harness {
    async fn new() -> Self {
        let notifier = Arc::new(InMemoryNotifier::new());
        let dedup = Arc::new(InMemoryDedupStore::new());
        let service = Arc::new(NotificationService::new(
            TemplateEngine::new().unwrap(),
            notifier.clone(),
            dedup.clone(),
            Duration::from_secs(3600),
        ));
        let bus = Arc::new(InMemoryEventBus::new());
        consumers::subscribe_all(bus.clone(), service.clone(), RetryPolicy::new(1, Duration::from_millis(1)))
            .await
            .unwrap();
        Self {
            service,
            notifier,
            dedup,
            bus,
        }
    }

    async fn deliver(&self, envelope: &EventEnvelope) {
        publish_event(self.bus.as_ref(), envelope).await.unwrap();
    }
}

fn captured(booking_id: Uuid, payer_id: Uuid) -> EventEnvelope {
    EventEnvelope::new(
        "payment-service",
        DomainEvent::PaymentCaptured(PaymentCaptured {
            intent_id: Some(Uuid::new_v4()),
            booking_id,
            payer_id: Some(payer_id),
            amount: 2450,
            currency: "EUR".to_string(),
            payment_method_type: Some("card".to_string()),
            payment_method_id: None,
            payment_provider: Some("mock".to_string()),
            hold_id: None,
            captured_at: Utc::now(),
        }),
    )
}

#[tokio::test]
async fn capture_notifies_the_payer_once() {
    let harness = Harness::new().await;
    let booking_id = Uuid::new_v4();
    let payer_id = Uuid::new_v4();
    let event = captured(booking_id, payer_id);

    harness.deliver(&event).await;
    harness.deliver(&event).await;

    let sent = harness.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, NotificationKind::PaymentCaptured);
    assert_eq!(sent[0].recipient_id, Some(payer_id));
    assert_eq!(sent[0].event_id, event.event_id);
    assert_eq!(
        sent[0].message,
        format!("Payment of 24.50 EUR received for booking {booking_id}.")
    );
}

#[tokio::test]
async fn each_outcome_gets_its_own_notification() {
    let harness = Harness::new().await;
    let booking_id = Uuid::new_v4();

    harness.deliver(&captured(booking_id, Uuid::new_v4())).await;
    harness
        .deliver(&EventEnvelope::new(
            "payment-service",
            DomainEvent::PaymentRefunded(PaymentRefunded {
                intent_id: None,
                booking_id,
                payer_id: None,
                amount: 1000,
                refunded_total: 1000,
                currency: "EUR".to_string(),
                fully_refunded: false,
                reason: None,
                refunded_at: Utc::now(),
            }),
        ))
        .await;
    harness
        .deliver(&EventEnvelope::new(
            "payment-service",
            DomainEvent::PaymentFailed(PaymentFailed {
                intent_id: None,
                booking_id: Uuid::new_v4(),
                payer_id: None,
                reason: "card_declined".to_string(),
                failed_at: Utc::now(),
            }),
        ))
        .await;

    let kinds: Vec<NotificationKind> = harness.notifier.sent().iter().map(|n| n.kind).collect();
    assert_eq!(
        kinds,
        vec![
            NotificationKind::PaymentCaptured,
            NotificationKind::PaymentRefunded,
            NotificationKind::PaymentFailed,
        ]
    );
    assert_eq!(
        harness.notifier.sent()[1].message,
        format!("10.00 EUR was refunded for booking {booking_id}.")
    );
}

#[tokio::test]
async fn failed_delivery_can_be_retried() {
    let harness = Harness::new().await;
    let event = captured(Uuid::new_v4(), Uuid::new_v4());

    harness.notifier.set_failing(true);
    harness.deliver(&event).await;
    assert!(harness.notifier.sent().is_empty());
    assert!(harness.dedup.is_empty());
    assert_eq!(harness.bus.count(&topics::dead_letter(topics::PAYMENT_CAPTURED)), 1);

    harness.notifier.set_failing(false);
    harness.service.handle(&event).await.unwrap();
    assert_eq!(harness.notifier.sent().len(), 1);
}

#[tokio::test]
async fn health_check_reports_the_service() {
    let harness = Harness::new().await;
    let server = TestServer::new(create_router(AppState {
        service: harness.service.clone(),
    }))
    .unwrap();

    let response = server.get("/health").await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["data"]["service"], "notification-service");

    server.get("/notifications").await.assert_status_not_found();
}
