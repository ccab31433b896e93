//! Bounded retries and dead-lettering for event consumers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::event_bus::{EventBus, EventHandler, Subscription};
use crate::events::{topics, DeadLetter, DomainEvent, EventEnvelope};
use crate::{AppError, RetryConfig};

pub const REASON_MAX_RETRIES: &str = "max_retries";
pub const REASON_INVALID_PAYLOAD: &str = "invalid_payload";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Linear backoff: the wait after failed attempt `n` is `n * base_delay`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500))
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, config.base_delay())
    }
}

/// Wraps a handler with retries. Once attempts are exhausted the original
/// envelope is published to `<topic>.dlq` and the message counts as handled.
pub struct RetryingHandler {
    inner: Arc<dyn EventHandler>,
    bus: Arc<dyn EventBus>,
    topic: String,
    policy: RetryPolicy,
}

impl RetryingHandler {
    pub fn wrap(
        inner: Arc<dyn EventHandler>,
        bus: Arc<dyn EventBus>,
        topic: &str,
        policy: RetryPolicy,
    ) -> Arc<dyn EventHandler> {
        Arc::new(Self {
            inner,
            bus,
            topic: topic.to_string(),
            policy,
        })
    }

    async fn dead_letter(
        &self,
        envelope: &EventEnvelope,
        reason: &str,
        error: &AppError,
        attempts: u32,
    ) -> Result<(), AppError> {
        let dlq_topic = topics::dead_letter(&self.topic);
        let letter = EventEnvelope::new(
            &envelope.source,
            DomainEvent::DeadLetter(DeadLetter {
                topic: self.topic.clone(),
                reason: reason.to_string(),
                error: error.to_string(),
                attempts,
                original: Box::new(envelope.clone()),
                failed_at: Utc::now(),
            }),
        );
        let key = envelope.partition_key();

        self.bus
            .publish(&dlq_topic, &letter, Some(&key))
            .await
            .map_err(|e| {
                tracing::error!(
                    topic = %dlq_topic,
                    event_id = %envelope.event_id,
                    error = %e,
                    "Dead-letter publish failed"
                );
                e
            })?;

        tracing::error!(
            topic = %self.topic,
            handler = self.inner.name(),
            event_id = %envelope.event_id,
            reason,
            attempts,
            error = %error,
            "Event dead-lettered"
        );
        Ok(())
    }
}

#[async_trait]
impl EventHandler for RetryingHandler {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), AppError> {
        if let Err(e) = envelope.event.validate() {
            return self.dead_letter(envelope, REASON_INVALID_PAYLOAD, &e, 0).await;
        }

        let mut attempt = 1;
        loop {
            let error = match self.inner.handle(envelope).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            if error.is_permanent() {
                return self
                    .dead_letter(envelope, REASON_INVALID_PAYLOAD, &error, attempt)
                    .await;
            }

            if attempt >= self.policy.max_attempts {
                return self
                    .dead_letter(envelope, REASON_MAX_RETRIES, &error, attempt)
                    .await;
            }

            tracing::warn!(
                topic = %self.topic,
                handler = self.inner.name(),
                event_id = %envelope.event_id,
                attempt,
                error = %error,
                "Handler failed, retrying"
            );
            tokio::time::sleep(self.policy.delay_after(attempt)).await;
            attempt += 1;
        }
    }
}

/// Subscribes `handler` behind a [`RetryingHandler`].
pub async fn subscribe_with_retry(
    bus: Arc<dyn EventBus>,
    group_id: &str,
    topic: &str,
    handler: Arc<dyn EventHandler>,
    policy: RetryPolicy,
) -> Result<Subscription, AppError> {
    let wrapped = RetryingHandler::wrap(handler, bus.clone(), topic, policy);
    bus.subscribe(group_id, topic, wrapped).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::{publish_event, InMemoryEventBus};
    use crate::events::{PaymentFailed, RideUpdated};
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    struct Flaky {
        calls: AtomicU32,
        fail_times: u32,
        error: fn() -> AppError,
    }

    #[async_trait]
    impl EventHandler for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn handle(&self, _envelope: &EventEnvelope) -> Result<(), AppError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_times {
                return Err((self.error)());
            }
            Ok(())
        }
    }

    fn flaky(fail_times: u32, error: fn() -> AppError) -> Arc<Flaky> {
        Arc::new(Flaky {
            calls: AtomicU32::new(0),
            fail_times,
            error,
        })
    }

    fn transient() -> AppError {
        AppError::ExternalService("downstream timeout".to_string())
    }

    fn fast() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1))
    }

    fn failed_event() -> EventEnvelope {
        EventEnvelope::new(
            "payment-service",
            DomainEvent::PaymentFailed(PaymentFailed {
                intent_id: None,
                booking_id: Uuid::new_v4(),
                payer_id: None,
                reason: "card declined".to_string(),
                failed_at: Utc::now(),
            }),
        )
    }

    #[test]
    fn backoff_is_linear_in_the_attempt_number() {
        let policy = RetryPolicy::new(3, Duration::from_millis(200));
        assert_eq!(policy.delay_after(1), Duration::from_millis(200));
        assert_eq!(policy.delay_after(2), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn recovers_before_the_bound() {
        let bus = Arc::new(InMemoryEventBus::new());
        let handler = flaky(2, transient);
        subscribe_with_retry(bus.clone(), "g", "payment.failed", handler.clone(), fast())
            .await
            .unwrap();

        publish_event(bus.as_ref(), &failed_event()).await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(bus.count("payment.failed.dlq"), 0);
    }

    #[tokio::test]
    async fn always_failing_handler_runs_three_times_then_dead_letters() {
        let bus = Arc::new(InMemoryEventBus::new());
        let handler = flaky(u32::MAX, transient);
        subscribe_with_retry(bus.clone(), "g", "payment.failed", handler.clone(), fast())
            .await
            .unwrap();

        let first = failed_event();
        publish_event(bus.as_ref(), &first).await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        let letters = bus.published();
        let letter = letters
            .iter()
            .find(|p| p.topic == "payment.failed.dlq")
            .expect("dead letter published");
        assert_eq!(letter.partition_key, first.partition_key());
        match &letter.envelope.event {
            DomainEvent::DeadLetter(dl) => {
                assert_eq!(dl.reason, REASON_MAX_RETRIES);
                assert_eq!(dl.attempts, 3);
                assert_eq!(dl.original.event_id, first.event_id);
            }
            other => panic!("unexpected event {other:?}"),
        }

        // The consumer keeps going with the next message.
        publish_event(bus.as_ref(), &failed_event()).await.unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 6);
        assert_eq!(bus.count("payment.failed.dlq"), 2);
    }

    #[tokio::test]
    async fn permanent_errors_skip_the_retries() {
        let bus = Arc::new(InMemoryEventBus::new());
        let handler = flaky(u32::MAX, || AppError::Validation("bad payload".to_string()));
        subscribe_with_retry(bus.clone(), "g", "payment.failed", handler.clone(), fast())
            .await
            .unwrap();

        publish_event(bus.as_ref(), &failed_event()).await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        let dlq = bus.published_on("payment.failed.dlq");
        assert!(matches!(
            &dlq[0].event,
            DomainEvent::DeadLetter(dl) if dl.reason == REASON_INVALID_PAYLOAD
        ));
    }

    #[tokio::test]
    async fn invalid_payloads_never_reach_the_handler() {
        let bus = Arc::new(InMemoryEventBus::new());
        let handler = flaky(0, transient);
        subscribe_with_retry(bus.clone(), "g", "ride.updated", handler.clone(), fast())
            .await
            .unwrap();

        let invalid = EventEnvelope::new(
            "ride-service",
            DomainEvent::RideUpdated(RideUpdated {
                ride_id: Uuid::new_v4(),
                seats_available: -1,
                status: "published".to_string(),
            }),
        );
        publish_event(bus.as_ref(), &invalid).await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        assert_eq!(bus.count("ride.updated.dlq"), 1);
    }
}
