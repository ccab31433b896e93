use std::sync::Arc;

use chrono::{Duration, Utc};
use uuid::Uuid;

use karigo_common::{AppError, ErrorCode};

use crate::config::PaymentServiceConfig;
use crate::models::VelocitySubject;
use crate::store::PaymentStore;

/// Limits how many intents one payer (or, without a payer, one booking) may
/// open within a sliding window.
pub struct VelocityGuard {
    store: Arc<dyn PaymentStore>,
    window: Duration,
    max_attempts: i64,
}

impl VelocityGuard {
    pub fn new(store: Arc<dyn PaymentStore>, window: Duration, max_attempts: i64) -> Self {
        Self {
            store,
            window,
            max_attempts,
        }
    }

    pub fn from_config(store: Arc<dyn PaymentStore>, config: &PaymentServiceConfig) -> Self {
        Self::new(
            store,
            Duration::minutes(config.velocity_window_minutes),
            config.velocity_max_attempts,
        )
    }

    pub async fn check(&self, payer_id: Option<Uuid>, booking_id: Uuid) -> Result<(), AppError> {
        let subject = VelocitySubject::for_request(payer_id, booking_id);
        let since = Utc::now() - self.window;
        let recent = self.store.count_created_since(subject, since).await?;

        if recent >= self.max_attempts {
            tracing::warn!(?subject, recent, "Payment velocity exceeded");
            return Err(AppError::rejected(
                ErrorCode::PaymentVelocityExceeded,
                format!(
                    "Too many payment attempts: {} within {} minutes",
                    recent,
                    self.window.num_minutes()
                ),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewPaymentIntent;
    use crate::store::InMemoryPaymentStore;
    use karigo_database::InMemoryOutboxStore;

    async fn open_intent(store: &InMemoryPaymentStore, payer: Uuid) -> Uuid {
        let booking_id = Uuid::new_v4();
        store
            .create_if_absent(NewPaymentIntent {
                booking_id,
                payer_id: Some(payer),
                amount: 500,
                currency: "EUR".to_string(),
                idempotency_key: None,
            })
            .await
            .unwrap();
        booking_id
    }

    #[tokio::test]
    async fn rejects_once_the_window_is_full() {
        let store = Arc::new(InMemoryPaymentStore::new(Arc::new(InMemoryOutboxStore::new())));
        let guard = VelocityGuard::new(store.clone(), Duration::minutes(10), 2);
        let payer = Uuid::new_v4();

        open_intent(&store, payer).await;
        guard.check(Some(payer), Uuid::new_v4()).await.unwrap();
        open_intent(&store, payer).await;

        let err = guard.check(Some(payer), Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::PaymentVelocityExceeded));
        assert_eq!(err.status_code(), 429);

        // Other payers are counted separately.
        guard.check(Some(Uuid::new_v4()), Uuid::new_v4()).await.unwrap();
    }

    #[tokio::test]
    async fn old_intents_fall_out_of_the_window() {
        let store = Arc::new(InMemoryPaymentStore::new(Arc::new(InMemoryOutboxStore::new())));
        let guard = VelocityGuard::new(store.clone(), Duration::minutes(10), 1);
        let payer = Uuid::new_v4();

        let booking = open_intent(&store, payer).await;
        assert!(guard.check(Some(payer), Uuid::new_v4()).await.is_err());

        store.backdate(booking, Utc::now() - Duration::minutes(11));
        guard.check(Some(payer), Uuid::new_v4()).await.unwrap();
    }
}
