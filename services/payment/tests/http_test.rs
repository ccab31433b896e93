mod common;

use axum::http::{HeaderName, HeaderValue, StatusCode};
use serde_json::{json, Value};
use uuid::Uuid;

use karigo_auth::{sign, SIGNATURE_HEADER};
use karigo_common::events::topics;
use karigo_common::{ApiError, ApiResponse};
use karigo_payment::config::PaymentServiceConfig;
use karigo_payment::models::{PaymentIntent, PaymentOperationResponse, PaymentStatus, WebhookResponse};

use common::{Harness, INTERNAL_KEY};

fn header(name: &'static str, value: &str) -> (HeaderName, HeaderValue) {
    (HeaderName::from_static(name), HeaderValue::from_str(value).unwrap())
}

fn capture_body(booking_id: Uuid, payer_id: Uuid) -> Value {
    json!({
        "bookingId": booking_id,
        "amount": 4200,
        "currency": "EUR",
        "payerId": payer_id,
        "paymentMethodType": "card",
        "paymentProvider": "stripe"
    })
}

#[tokio::test]
async fn health_check_reports_healthy() {
    let server = Harness::new().server();

    let response = server.get("/health").await;

    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["data"]["service"], "payment-service");
}

#[tokio::test]
async fn capture_replays_the_cached_response_for_the_same_key() {
    let harness = Harness::new();
    let server = harness.server();
    let booking_id = Uuid::new_v4();
    let body = capture_body(booking_id, Uuid::new_v4());
    let (name, value) = header("idempotency-key", "checkout-7");

    let first = server
        .post("/payments/capture")
        .add_header(name.clone(), value.clone())
        .json(&body)
        .await;
    first.assert_status_ok();
    let first: ApiResponse<PaymentOperationResponse> = first.json();

    let replay = server
        .post("/payments/capture")
        .add_header(name, value)
        .json(&body)
        .await;
    replay.assert_status_ok();
    let replay: ApiResponse<PaymentOperationResponse> = replay.json();

    assert_eq!(first.data, replay.data);
    assert_eq!(first.data.map(|d| d.status), Some(PaymentStatus::Confirmed));
    assert_eq!(harness.outbox.enqueued(topics::PAYMENT_CAPTURED).len(), 1);
}

#[tokio::test]
async fn key_reuse_with_another_body_is_a_409() {
    let server = Harness::new().server();
    let booking_id = Uuid::new_v4();
    let payer_id = Uuid::new_v4();
    let (name, value) = header("idempotency-key", "checkout-8");

    server
        .post("/payments/capture")
        .add_header(name.clone(), value.clone())
        .json(&capture_body(booking_id, payer_id))
        .await
        .assert_status_ok();

    let mut changed = capture_body(booking_id, payer_id);
    changed["amount"] = json!(1);
    let response = server
        .post("/payments/capture")
        .add_header(name, value)
        .json(&changed)
        .expect_failure()
        .await;

    response.assert_status(StatusCode::CONFLICT);
    let error: ApiError = response.json();
    assert_eq!(error.error_code, "idempotency_key_conflict");
}

#[tokio::test]
async fn velocity_rejections_are_429_with_a_stable_code() {
    let server = Harness::new().server();
    let payer_id = Uuid::new_v4();

    for _ in 0..5 {
        server
            .post("/payments/capture")
            .json(&capture_body(Uuid::new_v4(), payer_id))
            .await
            .assert_status_ok();
    }

    let response = server
        .post("/payments/capture")
        .json(&capture_body(Uuid::new_v4(), payer_id))
        .expect_failure()
        .await;

    response.assert_status(StatusCode::TOO_MANY_REQUESTS);
    let error: ApiError = response.json();
    assert_eq!(error.error_code, "payment_velocity_exceeded");
}

#[tokio::test]
async fn malformed_bodies_are_structured_validation_errors() {
    let harness = Harness::new();
    let server = harness.server();

    let response = server
        .post("/payments/capture")
        .json(&json!({ "amount": 100 }))
        .expect_failure()
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
    let error: ApiError = response.json();
    assert_eq!(error.error_code, "validation_error");

    let mut body = capture_body(Uuid::new_v4(), Uuid::new_v4());
    body["amount"] = json!("forty-two");
    let response = server
        .post("/payments/capture")
        .json(&body)
        .expect_failure()
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
    let error: ApiError = response.json();
    assert_eq!(error.error_code, "validation_error");
    assert!(harness.outbox.enqueued(topics::PAYMENT_CAPTURED).is_empty());
}

#[tokio::test]
async fn refund_of_an_unknown_booking_is_404() {
    let server = Harness::new().server();

    let response = server
        .post("/payments/refund")
        .json(&json!({ "bookingId": Uuid::new_v4(), "amount": 100 }))
        .expect_failure()
        .await;

    response.assert_status(StatusCode::NOT_FOUND);
    let error: ApiError = response.json();
    assert_eq!(error.error_code, "payment_intent_not_found");
}

#[tokio::test]
async fn internal_endpoints_require_the_internal_key() {
    let harness = Harness::new();
    let server = harness.server();
    let booking_id = Uuid::new_v4();

    server
        .post("/payments/capture")
        .json(&capture_body(booking_id, Uuid::new_v4()))
        .await
        .assert_status_ok();

    server
        .get(&format!("/payments/{booking_id}"))
        .expect_failure()
        .await
        .assert_status(StatusCode::UNAUTHORIZED);

    let (name, value) = header("x-internal-key", INTERNAL_KEY);
    let response = server
        .get(&format!("/payments/{booking_id}"))
        .add_header(name, value)
        .await;
    response.assert_status_ok();
    let intent: ApiResponse<PaymentIntent> = response.json();
    assert_eq!(intent.data.map(|i| i.amount), Some(4200));

    let (name, value) = header("x-internal-api-key", INTERNAL_KEY);
    server
        .post("/payments/fail")
        .add_header(name, value)
        .json(&json!({ "bookingId": Uuid::new_v4(), "reason": "provider timeout" }))
        .await
        .assert_status_ok();
}

#[tokio::test]
async fn webhook_duplicates_are_acknowledged() {
    let harness = Harness::new();
    let server = harness.server();
    let body = json!({
        "eventId": "evt_http_1",
        "type": "payment.failed",
        "payload": { "bookingId": Uuid::new_v4(), "reason": "insufficient funds" }
    });

    let first: ApiResponse<WebhookResponse> = server.post("/webhooks").json(&body).await.json();
    let second: ApiResponse<WebhookResponse> = server.post("/webhooks").json(&body).await.json();

    assert_eq!(first.data.map(|d| d.duplicate), Some(false));
    assert_eq!(second.data.map(|d| d.duplicate), Some(true));
    assert_eq!(harness.outbox.enqueued(topics::PAYMENT_FAILED).len(), 1);
}

#[tokio::test]
async fn webhook_signatures_are_checked_when_a_secret_is_set() {
    let harness = Harness::with_config(PaymentServiceConfig {
        webhook_secret: Some("whsec_test".to_string()),
        ..PaymentServiceConfig::default()
    });
    let server = harness.server();
    let body = json!({
        "eventId": "evt_signed",
        "type": "payment.failed",
        "payload": { "bookingId": Uuid::new_v4() }
    })
    .to_string();

    let (name, value) = header(SIGNATURE_HEADER, &sign("wrong-secret", body.as_bytes()));
    let response = server
        .post("/webhooks")
        .add_header(name, value)
        .text(body.clone())
        .expect_failure()
        .await;
    response.assert_status(StatusCode::UNAUTHORIZED);
    let error: ApiError = response.json();
    assert_eq!(error.error_code, "invalid_signature");

    let (name, value) = header(SIGNATURE_HEADER, &sign("whsec_test", body.as_bytes()));
    server
        .post("/webhooks")
        .add_header(name, value)
        .text(body)
        .await
        .assert_status_ok();
}

#[tokio::test]
async fn invoice_csv_is_served_as_text_csv() {
    let server = Harness::new().server();
    let payer_id = Uuid::new_v4();

    server
        .post("/payments/capture")
        .json(&capture_body(Uuid::new_v4(), payer_id))
        .await
        .assert_status_ok();

    let (name, value) = header("x-internal-key", INTERNAL_KEY);
    let response = server
        .get(&format!("/payments/invoices/{payer_id}/csv"))
        .add_header(name, value)
        .await;

    response.assert_status_ok();
    let content_type = response.header("content-type");
    assert!(content_type.to_str().unwrap().starts_with("text/csv"));
    let text = response.text();
    assert!(text.starts_with("bookingId,amount,currency,status,paymentMethodType,paymentProvider,createdAt"));
    assert!(text.contains("4200,EUR,CONFIRMED,card,stripe"));
}

#[tokio::test]
async fn mock_capture_is_hidden_when_disabled() {
    let harness = Harness::with_config(PaymentServiceConfig {
        mock_capture_enabled: false,
        ..PaymentServiceConfig::default()
    });
    let server = harness.server();

    server
        .post("/mock-capture")
        .json(&json!({ "bookingId": Uuid::new_v4(), "amount": 100 }))
        .expect_failure()
        .await
        .assert_status(StatusCode::NOT_FOUND);
    assert_eq!(harness.bus.count(topics::PAYMENT_CAPTURED), 0);
}

#[tokio::test]
async fn unknown_routes_get_a_json_404() {
    let server = Harness::new().server();

    let response = server.get("/nope").expect_failure().await;

    response.assert_status(StatusCode::NOT_FOUND);
    let body: ApiResponse<()> = response.json();
    assert!(!body.success);
}
