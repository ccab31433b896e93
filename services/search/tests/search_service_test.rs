use std::sync::Arc;
use std::time::Duration;

use axum_test::TestServer;
use chrono::{Duration as ChronoDuration, Utc};
use uuid::Uuid;

use karigo_common::events::{topics, DomainEvent, EventEnvelope, RidePublished, RideUpdated};
use karigo_common::{publish_event, ApiResponse, InMemoryDedupStore, InMemoryEventBus, RetryPolicy};
use karigo_search::consumers;
use karigo_search::index::InMemorySearchIndex;
use karigo_search::models::SearchDocument;
use karigo_search::service::SearchService;
use karigo_search::{create_router, AppState};

struct Harness {
    service: Arc<SearchService>,
    index: Arc<InMemorySearchIndex>,
    dedup: Arc<InMemoryDedupStore>,
    bus: Arc<InMemoryEventBus>,
}

impl Harness {
    async fn new(max_attempts: u32) -> Self {
        let index = Arc::new(InMemorySearchIndex::new());
        let dedup = Arc::new(InMemoryDedupStore::new());
        let service = Arc::new(SearchService::new(index.clone(), dedup.clone(), Duration::from_secs(3600)));
        let bus = Arc::new(InMemoryEventBus::new());
        consumers::subscribe_all(
            bus.clone(),
            service.clone(),
            RetryPolicy::new(max_attempts, Duration::from_millis(1)),
        )
        .await
        .unwrap();
        Self {
            service,
            index,
            dedup,
            bus,
        }
    }

    async fn deliver(&self, envelope: &EventEnvelope) {
        publish_event(self.bus.as_ref(), envelope).await.unwrap();
    }
}

fn published(ride_id: Uuid, origin: &str, destination: &str, hours_ahead: i64, seats: i32) -> EventEnvelope {
    EventEnvelope::new(
        "ride-service",
        DomainEvent::RidePublished(RidePublished {
            ride_id,
            driver_id: Uuid::new_v4(),
            origin: origin.to_string(),
            destination: destination.to_string(),
            departure_at: Utc::now() + ChronoDuration::hours(hours_ahead),
            seats_available: seats,
            price_per_seat: 1100,
            currency: "EUR".to_string(),
        }),
    )
}

fn updated(ride_id: Uuid, seats: i32) -> EventEnvelope {
    EventEnvelope::new(
        "ride-service",
        DomainEvent::RideUpdated(RideUpdated {
            ride_id,
            seats_available: seats,
            status: "published".to_string(),
        }),
    )
}

#[tokio::test]
async fn redelivered_publications_are_indexed_once() {
    let harness = Harness::new(1).await;
    let ride_id = Uuid::new_v4();

    // Two envelopes for the same ride, as a replay would produce.
    harness.deliver(&published(ride_id, "Lyon", "Grenoble", 5, 3)).await;
    harness.deliver(&published(ride_id, "Lyon", "Grenoble", 5, 3)).await;

    assert_eq!(harness.index.writes(), 1);
    assert_eq!(harness.index.get(ride_id).map(|d| d.seats_available), Some(3));
}

#[tokio::test]
async fn updates_are_deduplicated_by_event_id() {
    let harness = Harness::new(1).await;
    let ride_id = Uuid::new_v4();
    harness.deliver(&published(ride_id, "Lyon", "Grenoble", 5, 3)).await;

    let lock = updated(ride_id, 1);
    harness.deliver(&lock).await;
    harness.deliver(&lock).await;
    harness.deliver(&updated(ride_id, 0)).await;

    assert_eq!(harness.index.writes(), 3);
    assert_eq!(harness.index.get(ride_id).map(|d| d.seats_available), Some(0));
}

#[tokio::test]
async fn failed_index_writes_release_the_marker() {
    let harness = Harness::new(1).await;
    let ride_id = Uuid::new_v4();
    let event = published(ride_id, "Lyon", "Grenoble", 5, 3);

    harness.index.set_failing(true);
    harness.deliver(&event).await;
    assert!(harness.index.get(ride_id).is_none());
    assert_eq!(harness.bus.count(&topics::dead_letter(topics::RIDE_PUBLISHED)), 1);
    assert!(harness.dedup.is_empty());

    harness.index.set_failing(false);
    harness.deliver(&event).await;
    assert!(harness.index.get(ride_id).is_some());
}

#[tokio::test]
async fn retries_index_after_a_transient_failure() {
    let harness = Harness::new(3).await;
    let ride_id = Uuid::new_v4();
    harness.index.fail_next(1);

    harness.deliver(&published(ride_id, "Lyon", "Grenoble", 5, 3)).await;

    assert!(harness.index.get(ride_id).is_some());
    assert_eq!(harness.bus.count(&topics::dead_letter(topics::RIDE_PUBLISHED)), 0);
}

#[tokio::test]
async fn updates_for_unindexed_rides_are_ignored() {
    let harness = Harness::new(1).await;
    let ride_id = Uuid::new_v4();

    harness.deliver(&updated(ride_id, 2)).await;

    assert!(harness.index.get(ride_id).is_none());
    assert_eq!(harness.bus.count(&topics::dead_letter(topics::RIDE_UPDATED)), 0);
}

#[tokio::test]
async fn search_returns_bookable_rides_by_departure() {
    let harness = Harness::new(1).await;
    let later = Uuid::new_v4();
    let sooner = Uuid::new_v4();
    let full = Uuid::new_v4();
    harness.deliver(&published(later, "Lyon", "Grenoble", 48, 2)).await;
    harness.deliver(&published(sooner, "lyon", "grenoble", 3, 1)).await;
    harness.deliver(&published(full, "Lyon", "Grenoble", 10, 1)).await;
    harness.deliver(&published(Uuid::new_v4(), "Paris", "Lille", 1, 4)).await;
    harness.deliver(&updated(full, 0)).await;

    let server = TestServer::new(create_router(AppState {
        service: harness.service.clone(),
    }))
    .unwrap();
    let response = server
        .get("/search")
        .add_query_param("origin", "LYON")
        .add_query_param("destination", "Grenoble")
        .await;

    response.assert_status_ok();
    let body: ApiResponse<Vec<SearchDocument>> = response.json();
    let ids: Vec<Uuid> = body.data.unwrap().into_iter().map(|d| d.ride_id).collect();
    assert_eq!(ids, vec![sooner, later]);
}
