use handlebars::Handlebars;

use karigo_common::AppError;

use crate::models::NotificationKind;

const PAYMENT_CAPTURED: &str = "Payment of {{amount}} {{currency}} received for booking {{bookingId}}.";
const PAYMENT_REFUNDED: &str = "{{#if fullyRefunded}}Your payment for booking {{bookingId}} was fully refunded{{else}}{{amount}} {{currency}} was refunded for booking {{bookingId}}{{/if}}{{#if reason}} ({{reason}}){{/if}}.";
const PAYMENT_FAILED: &str = "Payment for booking {{bookingId}} failed: {{reason}}.";

#[derive(Clone)]
pub struct TemplateEngine {
    handlebars: Handlebars<'static>,
}

impl TemplateEngine {
    pub fn new() -> Result<Self, AppError> {
        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(true);
        // Messages are plain text
        handlebars.register_escape_fn(handlebars::no_escape);

        for (kind, source) in [
            (NotificationKind::PaymentCaptured, PAYMENT_CAPTURED),
            (NotificationKind::PaymentRefunded, PAYMENT_REFUNDED),
            (NotificationKind::PaymentFailed, PAYMENT_FAILED),
        ] {
            handlebars
                .register_template_string(kind.template(), source)
                .map_err(|e| AppError::Internal(format!("Template registration error: {}", e)))?;
        }

        Ok(Self { handlebars })
    }

    pub fn render(&self, kind: NotificationKind, data: &serde_json::Value) -> Result<String, AppError> {
        self.handlebars
            .render(kind.template(), data)
            .map_err(|e| AppError::Internal(format!("Template rendering error: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_captures() {
        let engine = TemplateEngine::new().unwrap();
        let message = engine
            .render(
                NotificationKind::PaymentCaptured,
                &json!({"bookingId": "b-1", "amount": "12.50", "currency": "EUR"}),
            )
            .unwrap();
        assert_eq!(message, "Payment of 12.50 EUR received for booking b-1.");
    }

    #[test]
    fn partial_and_full_refunds_read_differently() {
        let engine = TemplateEngine::new().unwrap();
        let partial = engine
            .render(
                NotificationKind::PaymentRefunded,
                &json!({"bookingId": "b-1", "amount": "4.00", "currency": "EUR", "fullyRefunded": false, "reason": null}),
            )
            .unwrap();
        assert_eq!(partial, "4.00 EUR was refunded for booking b-1.");

        let full = engine
            .render(
                NotificationKind::PaymentRefunded,
                &json!({"bookingId": "b-1", "amount": "8.00", "currency": "EUR", "fullyRefunded": true, "reason": "ride cancelled"}),
            )
            .unwrap();
        assert_eq!(full, "Your payment for booking b-1 was fully refunded (ride cancelled).");
    }

    #[test]
    fn missing_fields_fail_in_strict_mode() {
        let engine = TemplateEngine::new().unwrap();
        assert!(engine
            .render(NotificationKind::PaymentFailed, &json!({"bookingId": "b-1"}))
            .is_err());
    }
}
