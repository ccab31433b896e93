use std::sync::Arc;

use async_trait::async_trait;

use karigo_common::events::{topics, DomainEvent, EventEnvelope};
use karigo_common::{subscribe_with_retry, AppError, EventBus, EventHandler, RetryPolicy, Subscription};

use crate::service::WalletService;

pub const CONSUMER_GROUP: &str = "wallet-service";

pub struct HoldSettlementConsumer {
    service: Arc<WalletService>,
}

impl HoldSettlementConsumer {
    pub fn new(service: Arc<WalletService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl EventHandler for HoldSettlementConsumer {
    fn name(&self) -> &str {
        "wallet-hold-settlement"
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
    service: Arc<WalletService>,
    policy: RetryPolicy,
) -> Result<Vec<Subscription>, AppError> {
    let handler: Arc<dyn EventHandler> = Arc::new(HoldSettlementConsumer::new(service));

    let mut subscriptions = Vec::new();
    for topic in [topics::PAYMENT_CAPTURED, topics::PAYMENT_FAILED] {
        subscriptions.push(subscribe_with_retry(bus.clone(), CONSUMER_GROUP, topic, handler.clone(), policy).await?);
    }
    Ok(subscriptions)
}
