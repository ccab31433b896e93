use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum_test::TestServer;
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use karigo_booking::consumers;
use karigo_booking::models::{Booking, BookingStatus, CreateBookingRequest};
use karigo_booking::rides::RideClient;
use karigo_booking::service::BookingService;
use karigo_booking::store::InMemoryBookingStore;
use karigo_booking::{create_router, AppState};
use karigo_common::events::{topics, DomainEvent, EventEnvelope, PaymentCaptured, PaymentFailed};
use karigo_common::{publish_event, ApiError, ApiResponse, ErrorCode, InMemoryEventBus, PeerClient, PeerConfig, RetryPolicy};
use karigo_database::InMemoryOutboxStore;

struct Harness {
    service: Arc<BookingService>,
    outbox: Arc<InMemoryOutboxStore>,
}

impl Harness {
    fn new(ride_url: &str) -> Self {
        let outbox = Arc::new(InMemoryOutboxStore::new());
        let store = Arc::new(InMemoryBookingStore::new(outbox.clone()));
        let peer = PeerClient::new(
            "ride-service",
            PeerConfig {
                base_url: ride_url.to_string(),
                timeout_ms: 3_000,
                internal_key: "test-internal-key".to_string(),
            },
        )
        .unwrap();
        let service = Arc::new(BookingService::new(store, RideClient::new(peer), "EUR"));
        Self { service, outbox }
    }

    fn server(&self) -> TestServer {
        TestServer::new(create_router(AppState {
            service: self.service.clone(),
        }))
        .unwrap()
    }
}

fn request(ride_id: Uuid) -> CreateBookingRequest {
    CreateBookingRequest {
        ride_id,
        passenger_id: Uuid::new_v4(),
        seats: 2,
        amount: 2400,
        currency: None,
    }
}

fn envelope(data: serde_json::Value) -> String {
    json!({
        "success": true,
        "data": data,
        "error": null,
        "timestamp": "2024-05-01T10:00:00Z"
    })
    .to_string()
}

fn lock_reply(server: &mut mockito::Server, ride_id: Uuid) -> mockito::Mock {
    server
        .mock("POST", format!("/rides/{ride_id}/lock").as_str())
        .match_header("x-internal-key", "test-internal-key")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(envelope(json!({
            "rideId": ride_id,
            "bookingId": Uuid::new_v4(),
            "seats": 2,
            "seatsAvailable": 1,
            "alreadyLocked": false
        })))
}

async fn lock_ok(server: &mut mockito::Server, ride_id: Uuid) -> mockito::Mock {
    lock_reply(server, ride_id).create_async().await
}

async fn unlock_ok(server: &mut mockito::Server, ride_id: Uuid) -> mockito::Mock {
    server
        .mock("POST", format!("/rides/{ride_id}/unlock").as_str())
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(envelope(json!({
            "rideId": ride_id,
            "bookingId": Uuid::new_v4(),
            "releasedSeats": 2,
            "seatsAvailable": 3
        })))
        .create_async()
        .await
}

fn captured(booking_id: Uuid) -> EventEnvelope {
    EventEnvelope::new(
        "payment-service",
        DomainEvent::PaymentCaptured(PaymentCaptured {
            intent_id: Some(Uuid::new_v4()),
            booking_id,
            payer_id: None,
            amount: 2400,
            currency: "EUR".to_string(),
            payment_method_type: Some("card".to_string()),
            payment_method_id: None,
            payment_provider: None,
            hold_id: None,
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

fn fast() -> RetryPolicy {
    RetryPolicy::new(1, Duration::from_millis(1))
}

#[tokio::test]
async fn booking_locks_seats_and_requests_a_payment_intent() {
    let mut ride = mockito::Server::new_async().await;
    let ride_id = Uuid::new_v4();
    let mock = lock_ok(&mut ride, ride_id).await;
    let harness = Harness::new(&ride.url());

    let booking = harness.service.create_booking(request(ride_id)).await.unwrap();

    mock.assert_async().await;
    assert_eq!(booking.status, BookingStatus::PendingPayment);
    assert_eq!(booking.currency, "EUR");

    let intents = harness.outbox.enqueued(topics::PAYMENT_INTENT);
    assert_eq!(intents.len(), 1);
    match &intents[0].event {
        DomainEvent::PaymentIntent(intent) => {
            assert_eq!(intent.booking_id, booking.id);
            assert_eq!(intent.payer_id, Some(booking.passenger_id));
            assert_eq!(intent.amount, 2400);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn lock_conflicts_surface_as_409_without_a_booking() {
    let mut ride = mockito::Server::new_async().await;
    let ride_id = Uuid::new_v4();
    ride.mock("POST", format!("/rides/{ride_id}/lock").as_str())
        .with_status(409)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "errorCode": "insufficient_seats",
                "message": "Requested 2 seats, 1 available",
                "details": null,
                "timestamp": "2024-05-01T10:00:00Z",
                "requestId": "req-1"
            })
            .to_string(),
        )
        .create_async()
        .await;
    let harness = Harness::new(&ride.url());

    let response = harness
        .server()
        .post("/bookings")
        .json(&json!({
            "rideId": ride_id,
            "passengerId": Uuid::new_v4(),
            "seats": 2,
            "amount": 2400
        }))
        .expect_failure()
        .await;

    response.assert_status(StatusCode::CONFLICT);
    let error: ApiError = response.json();
    assert_eq!(error.error_code, "insufficient_seats");
    assert_eq!(harness.outbox.pending(), 0);
}

#[tokio::test]
async fn ride_service_outage_is_a_502() {
    // Nothing listens on port 1.
    let harness = Harness::new("http://127.0.0.1:1");

    let response = harness
        .server()
        .post("/bookings")
        .json(&json!({
            "rideId": Uuid::new_v4(),
            "passengerId": Uuid::new_v4(),
            "seats": 1,
            "amount": 1200
        }))
        .expect_failure()
        .await;

    response.assert_status(StatusCode::BAD_GATEWAY);
    assert_eq!(harness.outbox.pending(), 0);
}

#[tokio::test]
async fn captured_payment_confirms_once() {
    let mut ride = mockito::Server::new_async().await;
    let ride_id = Uuid::new_v4();
    lock_ok(&mut ride, ride_id).await;
    let harness = Harness::new(&ride.url());
    let booking = harness.service.create_booking(request(ride_id)).await.unwrap();

    let bus = Arc::new(InMemoryEventBus::new());
    let _subscriptions = consumers::subscribe_all(bus.clone(), harness.service.clone(), fast())
        .await
        .unwrap();

    let event = captured(booking.id);
    publish_event(bus.as_ref(), &event).await.unwrap();
    publish_event(bus.as_ref(), &event).await.unwrap();

    let stored = harness.service.get_booking(booking.id).await.unwrap();
    assert_eq!(stored.status, BookingStatus::Confirmed);
    assert_eq!(bus.count(&topics::dead_letter(topics::PAYMENT_CAPTURED)), 0);
}

#[tokio::test]
async fn failed_payment_cancels_and_releases_seats() {
    let mut ride = mockito::Server::new_async().await;
    let ride_id = Uuid::new_v4();
    lock_ok(&mut ride, ride_id).await;
    let unlock = unlock_ok(&mut ride, ride_id).await;
    let harness = Harness::new(&ride.url());
    let booking = harness.service.create_booking(request(ride_id)).await.unwrap();

    let event = failed(booking.id);
    let DomainEvent::PaymentFailed(payload) = &event.event else {
        unreachable!()
    };
    harness.service.handle_failed(payload).await.unwrap();
    harness.service.handle_failed(payload).await.unwrap();

    unlock.assert_async().await;
    let stored = harness.service.get_booking(booking.id).await.unwrap();
    assert_eq!(stored.status, BookingStatus::Cancelled);
}

#[tokio::test]
async fn capture_after_a_failed_attempt_relocks_and_confirms() {
    let mut ride = mockito::Server::new_async().await;
    let ride_id = Uuid::new_v4();
    let lock = lock_reply(&mut ride, ride_id).expect(2).create_async().await;
    let unlock = unlock_ok(&mut ride, ride_id).await;
    let harness = Harness::new(&ride.url());
    let booking = harness.service.create_booking(request(ride_id)).await.unwrap();

    if let DomainEvent::PaymentFailed(payload) = &failed(booking.id).event {
        harness.service.handle_failed(payload).await.unwrap();
    }
    assert_eq!(
        harness.service.get_booking(booking.id).await.unwrap().status,
        BookingStatus::Cancelled
    );

    if let DomainEvent::PaymentCaptured(payload) = &captured(booking.id).event {
        harness.service.handle_captured(payload).await.unwrap();
        // Redelivery of the same capture is a no-op.
        harness.service.handle_captured(payload).await.unwrap();
    }

    lock.assert_async().await;
    unlock.assert_async().await;
    let stored = harness.service.get_booking(booking.id).await.unwrap();
    assert_eq!(stored.status, BookingStatus::Confirmed);
}

#[tokio::test]
async fn capture_for_a_cancelled_booking_without_seats_stays_cancelled() {
    let mut ride = mockito::Server::new_async().await;
    let ride_id = Uuid::new_v4();
    let lock = lock_ok(&mut ride, ride_id).await;
    unlock_ok(&mut ride, ride_id).await;
    let harness = Harness::new(&ride.url());
    let booking = harness.service.create_booking(request(ride_id)).await.unwrap();

    if let DomainEvent::PaymentFailed(payload) = &failed(booking.id).event {
        harness.service.handle_failed(payload).await.unwrap();
    }

    lock.remove_async().await;
    let sold_out = ride
        .mock("POST", format!("/rides/{ride_id}/lock").as_str())
        .with_status(409)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "errorCode": "insufficient_seats",
                "message": "Requested 2 seats, 0 available",
                "details": null,
                "timestamp": "2024-05-01T10:00:00Z",
                "requestId": "req-2"
            })
            .to_string(),
        )
        .create_async()
        .await;

    let bus = Arc::new(InMemoryEventBus::new());
    let _subscriptions = consumers::subscribe_all(bus.clone(), harness.service.clone(), fast())
        .await
        .unwrap();
    publish_event(bus.as_ref(), &captured(booking.id)).await.unwrap();

    sold_out.assert_async().await;
    let stored = harness.service.get_booking(booking.id).await.unwrap();
    assert_eq!(stored.status, BookingStatus::Cancelled);
    assert_eq!(bus.count(&topics::dead_letter(topics::PAYMENT_CAPTURED)), 0);
}

#[tokio::test]
async fn unknown_bookings_are_404_and_unknown_events_are_ignored() {
    let harness = Harness::new("http://127.0.0.1:1");
    let missing = Uuid::new_v4();

    let err = harness.service.get_booking(missing).await.unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::BookingNotFound));

    if let DomainEvent::PaymentCaptured(payload) = &captured(missing).event {
        harness.service.handle_captured(payload).await.unwrap();
    }

    let response = harness
        .server()
        .get(&format!("/bookings/{missing}"))
        .expect_failure()
        .await;
    response.assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn bookings_are_served_over_http() {
    let mut ride = mockito::Server::new_async().await;
    let ride_id = Uuid::new_v4();
    lock_ok(&mut ride, ride_id).await;
    let harness = Harness::new(&ride.url());
    let server = harness.server();

    let response = server
        .post("/bookings")
        .json(&json!({
            "rideId": ride_id,
            "passengerId": Uuid::new_v4(),
            "seats": 2,
            "amount": 2400,
            "currency": "chf"
        }))
        .await;
    response.assert_status(StatusCode::CREATED);
    let created: ApiResponse<Booking> = response.json();
    let created = created.data.unwrap();
    assert_eq!(created.currency, "CHF");

    let fetched: ApiResponse<Booking> = server.get(&format!("/bookings/{}", created.id)).await.json();
    assert_eq!(fetched.data.map(|b| b.status), Some(BookingStatus::PendingPayment));
}
