use std::sync::Arc;

use async_trait::async_trait;

use karigo_common::events::{topics, DomainEvent, EventEnvelope};
use karigo_common::{subscribe_with_retry, AppError, EventBus, EventHandler, RetryPolicy, Subscription};

use crate::service::SearchService;

pub const CONSUMER_GROUP: &str = "search-service";

/// Keeps the index in step with `ride.published` and `ride.updated`.
pub struct RideIndexer {
    service: Arc<SearchService>,
}

impl RideIndexer {
    pub fn new(service: Arc<SearchService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl EventHandler for RideIndexer {
    fn name(&self) -> &str {
        "ride-indexer"
    }

    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), AppError> {
        match &envelope.event {
            DomainEvent::RidePublished(ride) => self.service.handle_published(ride).await,
            DomainEvent::RideUpdated(update) => self.service.handle_updated(envelope, update).await,
            other => Err(AppError::Validation(format!("{} is not a ride event", other.type_name()))),
        }
    }
}

pub async fn subscribe_all(
    bus: Arc<dyn EventBus>,
    service: Arc<SearchService>,
    policy: RetryPolicy,
) -> Result<Vec<Subscription>, AppError> {
    let handler: Arc<dyn EventHandler> = Arc::new(RideIndexer::new(service));

    let mut subscriptions = Vec::new();
    for topic in [topics::RIDE_PUBLISHED, topics::RIDE_UPDATED] {
        subscriptions.push(subscribe_with_retry(bus.clone(), CONSUMER_GROUP, topic, handler.clone(), policy).await?);
    }
    Ok(subscriptions)
}
