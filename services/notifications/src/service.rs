use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use karigo_common::events::EventEnvelope;
use karigo_common::{AppError, DedupStore};

use crate::models::{Notification, PaymentNotice};
use crate::notifier::Notifier;
use crate::templates::TemplateEngine;

pub struct NotificationService {
    templates: TemplateEngine,
    notifier: Arc<dyn Notifier>,
    dedup: Arc<dyn DedupStore>,
    dedup_ttl: Duration,
}

impl NotificationService {
    pub fn new(
        templates: TemplateEngine,
        notifier: Arc<dyn Notifier>,
        dedup: Arc<dyn DedupStore>,
        dedup_ttl: Duration,
    ) -> Self {
        Self {
            templates,
            notifier,
            dedup,
            dedup_ttl,
        }
    }

    /// Notifies the payer of a payment outcome, once per event.
    pub async fn handle(&self, envelope: &EventEnvelope) -> Result<(), AppError> {
        let Some(notice) = PaymentNotice::from_envelope(envelope) else {
            return Err(AppError::Validation(format!(
                "{} is not a payment outcome",
                envelope.event.type_name()
            )));
        };

        let key = format!("notify:{}", envelope.event_id);
        if !self.dedup.first_time(&key, self.dedup_ttl).await? {
            tracing::debug!(event_id = %envelope.event_id, "Notification already sent, skipping");
            return Ok(());
        }

        let result = self.notify(envelope, notice).await;
        if let Err(e) = &result {
            tracing::warn!(event_id = %envelope.event_id, error = %e, "Notification failed, releasing dedup marker");
            if let Err(forget_err) = self.dedup.forget(&key).await {
                tracing::error!(dedup_key = %key, error = %forget_err, "Could not release dedup marker");
            }
        }
        result
    }

    async fn notify(&self, envelope: &EventEnvelope, notice: PaymentNotice) -> Result<(), AppError> {
        let message = self.templates.render(notice.kind, &notice.data)?;
        let notification = Notification {
            event_id: envelope.event_id.clone(),
            kind: notice.kind,
            recipient_id: notice.recipient_id,
            booking_id: notice.booking_id,
            message,
            created_at: Utc::now(),
        };
        self.notifier.deliver(&notification).await
    }
}
