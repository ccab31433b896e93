use std::sync::Arc;

use async_trait::async_trait;

use karigo_common::events::{topics, DomainEvent, EventEnvelope};
use karigo_common::{subscribe_with_retry, AppError, EventBus, EventHandler, RetryPolicy, Subscription};

use crate::service::BookingService;

pub const CONSUMER_GROUP: &str = "booking-service";

/// Settles bookings from `payment.captured` and `payment.failed`.
pub struct PaymentOutcomeConsumer {
    service: Arc<BookingService>,
}

impl PaymentOutcomeConsumer {
    pub fn new(service: Arc<BookingService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl EventHandler for PaymentOutcomeConsumer {
    fn name(&self) -> &str {
        "booking-settlement"
    }

    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), AppError> {
        match &envelope.event {
            DomainEvent::PaymentCaptured(captured) => self.service.handle_captured(captured).await,
            DomainEvent::PaymentFailed(failed) => self.service.handle_failed(failed).await,
            other => Err(AppError::Validation(format!(
                "{} is not a payment outcome",
                other.type_name()
            ))),
        }
    }
}

pub async fn subscribe_all(
    bus: Arc<dyn EventBus>,
    service: Arc<BookingService>,
    policy: RetryPolicy,
) -> Result<Vec<Subscription>, AppError> {
    let handler: Arc<dyn EventHandler> = Arc::new(PaymentOutcomeConsumer::new(service));

    let mut subscriptions = Vec::new();
    for topic in [topics::PAYMENT_CAPTURED, topics::PAYMENT_FAILED] {
        subscriptions.push(
            subscribe_with_retry(bus.clone(), CONSUMER_GROUP, topic, handler.clone(), policy).await?,
        );
    }
    Ok(subscriptions)
}
