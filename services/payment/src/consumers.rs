use std::sync::Arc;

use async_trait::async_trait;

use karigo_common::events::{topics, DomainEvent, EventEnvelope};
use karigo_common::{subscribe_with_retry, AppError, EventBus, EventHandler, RetryPolicy, Subscription};

use crate::service::PaymentService;

pub const CONSUMER_GROUP: &str = "payment-service";

/// Opens intents announced on `payment.intent`.
pub struct PaymentIntentConsumer {
    service: Arc<PaymentService>,
}

impl PaymentIntentConsumer {
    pub fn new(service: Arc<PaymentService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl EventHandler for PaymentIntentConsumer {
    fn name(&self) -> &str {
        "payment-intent"
    }

    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), AppError> {
        match &envelope.event {
            DomainEvent::PaymentIntent(requested) => {
                self.service.handle_payment_intent(requested).await?;
                Ok(())
            }
            other => Err(AppError::Validation(format!(
                "{} is not a payment intent event",
                other.type_name()
            ))),
        }
    }
}

pub async fn subscribe_all(
    bus: Arc<dyn EventBus>,
    service: Arc<PaymentService>,
    policy: RetryPolicy,
) -> Result<Vec<Subscription>, AppError> {
    let intents = subscribe_with_retry(
        bus,
        CONSUMER_GROUP,
        topics::PAYMENT_INTENT,
        Arc::new(PaymentIntentConsumer::new(service)),
        policy,
    )
    .await?;
    Ok(vec![intents])
}
