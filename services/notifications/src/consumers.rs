use std::sync::Arc;

use async_trait::async_trait;

use karigo_common::events::{topics, EventEnvelope};
use karigo_common::{subscribe_with_retry, AppError, EventBus, EventHandler, RetryPolicy, Subscription};

use crate::service::NotificationService;

pub const CONSUMER_GROUP: &str = "notification-service";

pub struct PaymentNotifier {
    service: Arc<NotificationService>,
}

impl PaymentNotifier {
    pub fn new(service: Arc<NotificationService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl EventHandler for PaymentNotifier {
    fn name(&self) -> &str {
        "payment-notifier"
    }

    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), AppError> {
        self.service.handle(envelope).await
    }
}

pub async fn subscribe_all(
    bus: Arc<dyn EventBus>,
    service: Arc<NotificationService>,
    policy: RetryPolicy,
) -> Result<Vec<Subscription>, AppError> {
    let handler: Arc<dyn EventHandler> = Arc::new(PaymentNotifier::new(service));

    let mut subscriptions = Vec::new();
    for topic in [topics::PAYMENT_CAPTURED, topics::PAYMENT_REFUNDED, topics::PAYMENT_FAILED] {
        subscriptions.push(subscribe_with_retry(bus.clone(), CONSUMER_GROUP, topic, handler.clone(), policy).await?);
    }
    Ok(subscriptions)
}
