//! Payment intent lifecycle: capture, refund, failure and webhook relay.
//!
//! Every state change goes through [`PaymentStore::save`], which bumps the
//! intent version and writes the resulting events to the event log and the
//! outbox in the same transaction. A save that loses an optimistic race is
//! retried against the reloaded intent.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;
use validator::Validate;

use karigo_common::events::{DomainEvent, EventEnvelope, PaymentCaptured, PaymentFailed, PaymentIntentRequested, PaymentRefunded};
use karigo_common::{publish_best_effort, AppError, ErrorCode, EventBus};

use crate::config::PaymentServiceConfig;
use crate::idempotency::{Admission, IdempotencyLedger, IdempotencyStore};
use crate::invoices::{build_invoice, parse_month};
use crate::models::{
    truncate_reason, CaptureRequest, EventSource, FailRequest, IdempotencyStatus, Invoice, MockCaptureRequest,
    MockCaptureResponse, NewPaymentIntent, PaymentEventRecord, PaymentIntent, PaymentOperationResponse,
    PaymentStatus, RefundRequest, FailResponse, WebhookRequest, WebhookResponse,
};
use crate::store::PaymentStore;
use crate::velocity::VelocityGuard;

pub const SERVICE_SOURCE: &str = "payment-service";
pub const WEBHOOK_SOURCE: &str = "payment-webhook";

const MAX_SAVE_ATTEMPTS: u32 = 3;
const OP_CAPTURE: &str = "capture";
const OP_REFUND: &str = "refund";

pub struct PaymentService {
    store: Arc<dyn PaymentStore>,
    ledger: IdempotencyLedger,
    velocity: VelocityGuard,
    bus: Arc<dyn EventBus>,
    config: PaymentServiceConfig,
}

impl PaymentService {
    pub fn new(
        store: Arc<dyn PaymentStore>,
        idempotency: Arc<dyn IdempotencyStore>,
        bus: Arc<dyn EventBus>,
        config: PaymentServiceConfig,
    ) -> Self {
        Self {
            velocity: VelocityGuard::from_config(store.clone(), &config),
            ledger: IdempotencyLedger::new(idempotency),
            store,
            bus,
            config,
        }
    }

    pub fn config(&self) -> &PaymentServiceConfig {
        &self.config
    }

    pub async fn capture(
        &self,
        idempotency_key: Option<&str>,
        request: CaptureRequest,
    ) -> Result<PaymentOperationResponse, AppError> {
        request.validate()?;

        let payload = serde_json::to_value(&request)?;
        let reservation = match self.ledger.check(idempotency_key, OP_CAPTURE, &payload).await? {
            Admission::Replay(response) => return Ok(response),
            Admission::Proceed(reservation) => reservation,
        };

        let outcome = self.capture_intent(idempotency_key, &request).await;
        self.ledger.finish(reservation, outcome).await
    }

    async fn capture_intent(
        &self,
        idempotency_key: Option<&str>,
        request: &CaptureRequest,
    ) -> Result<(PaymentOperationResponse, IdempotencyStatus), AppError> {
        self.velocity.check(request.payer_id, request.booking_id).await?;

        let currency = request
            .currency
            .as_deref()
            .map(str::to_uppercase)
            .unwrap_or_else(|| self.config.default_currency.clone());

        let mut attempt = 0;
        loop {
            attempt += 1;

            let (intent, created) = self
                .store
                .create_if_absent(NewPaymentIntent {
                    booking_id: request.booking_id,
                    payer_id: request.payer_id,
                    amount: request.amount,
                    currency: currency.clone(),
                    idempotency_key: idempotency_key.map(str::to_string),
                })
                .await?;

            match intent.status {
                PaymentStatus::Confirmed => {
                    tracing::debug!(booking_id = %intent.booking_id, "Capture of confirmed intent is a no-op");
                    return Ok((
                        PaymentOperationResponse::from_intent(&intent, 0, true),
                        IdempotencyStatus::Cached,
                    ));
                }
                PaymentStatus::Refunded => {
                    return Err(AppError::rejected(
                        ErrorCode::PaymentAlreadyRefunded,
                        "Payment has already been refunded",
                    ));
                }
                PaymentStatus::Pending | PaymentStatus::Failed => {}
            }

            if intent.amount != request.amount {
                tracing::warn!(
                    booking_id = %intent.booking_id,
                    intent_amount = intent.amount,
                    requested_amount = request.amount,
                    "Capture amount does not match the payment intent"
                );
                return Err(AppError::rejected(
                    ErrorCode::PaymentAmountMismatch,
                    format!(
                        "Capture of {} does not match the intent amount of {}",
                        request.amount, intent.amount
                    ),
                ));
            }

            let now = Utc::now();
            let mut next = intent.clone();
            next.status = PaymentStatus::Confirmed;
            next.captured_at = Some(now);
            next.payer_id = next.payer_id.or(request.payer_id);
            next.payment_method_type = request.payment_method_type.clone();
            next.payment_method_id = request.payment_method_id.clone();
            next.payment_provider = request.payment_provider.clone();
            next.failure_reason = None;
            if let Some(key) = idempotency_key {
                next.idempotency_key = Some(key.to_string());
            }

            let event = captured_event(&next, now);
            match self.store.save(&next, &[event]).await {
                Ok(saved) => {
                    tracing::info!(
                        booking_id = %saved.booking_id,
                        intent_id = %saved.id,
                        amount = saved.amount,
                        created,
                        "Payment captured"
                    );
                    return Ok((
                        PaymentOperationResponse::from_intent(&saved, saved.amount, false),
                        IdempotencyStatus::Success,
                    ));
                }
                Err(e) if is_lost_race(&e) && attempt < MAX_SAVE_ATTEMPTS => {
                    tracing::debug!(booking_id = %request.booking_id, attempt, "Capture lost a race, reloading");
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn refund(
        &self,
        idempotency_key: Option<&str>,
        request: RefundRequest,
    ) -> Result<PaymentOperationResponse, AppError> {
        request.validate()?;

        let payload = serde_json::to_value(&request)?;
        let reservation = match self.ledger.check(idempotency_key, OP_REFUND, &payload).await? {
            Admission::Replay(response) => return Ok(response),
            Admission::Proceed(reservation) => reservation,
        };

        let outcome = self.refund_intent(&request).await;
        self.ledger.finish(reservation, outcome).await
    }

    async fn refund_intent(
        &self,
        request: &RefundRequest,
    ) -> Result<(PaymentOperationResponse, IdempotencyStatus), AppError> {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let intent = self.find_intent(request.booking_id).await?;
            if intent.status == PaymentStatus::Refunded || intent.refundable() <= 0 {
                return Err(AppError::rejected(
                    ErrorCode::RefundAmountExceeded,
                    "Nothing left to refund on this payment",
                ));
            }
            if intent.status != PaymentStatus::Confirmed {
                return Err(AppError::rejected(
                    ErrorCode::PaymentNotCaptured,
                    format!("Payment is {} and cannot be refunded", intent.status.as_str()),
                ));
            }

            let amount = request.amount.min(intent.refundable());
            if amount <= 0 {
                return Err(AppError::rejected(
                    ErrorCode::RefundAmountExceeded,
                    "Refund amount exceeds the refundable remainder",
                ));
            }

            let now = Utc::now();
            let mut next = intent.clone();
            next.refunded_amount += amount;
            next.refunded_at = Some(now);
            let fully_refunded = next.refunded_amount == next.amount;
            if fully_refunded {
                next.status = PaymentStatus::Refunded;
            }

            let event = EventEnvelope::new(
                SERVICE_SOURCE,
                DomainEvent::PaymentRefunded(PaymentRefunded {
                    intent_id: Some(next.id),
                    booking_id: next.booking_id,
                    payer_id: next.payer_id.or(request.payer_id),
                    amount,
                    refunded_total: next.refunded_amount,
                    currency: next.currency.clone(),
                    fully_refunded,
                    reason: request.reason.clone(),
                    refunded_at: now,
                }),
            );

            match self.store.save(&next, &[event]).await {
                Ok(saved) => {
                    if amount < request.amount {
                        tracing::info!(
                            booking_id = %saved.booking_id,
                            requested = request.amount,
                            refunded = amount,
                            "Refund clamped to the refundable remainder"
                        );
                    }
                    tracing::info!(
                        booking_id = %saved.booking_id,
                        amount,
                        refunded_total = saved.refunded_amount,
                        fully_refunded,
                        "Payment refunded"
                    );
                    return Ok((
                        PaymentOperationResponse::from_intent(&saved, amount, false),
                        IdempotencyStatus::Success,
                    ));
                }
                Err(e) if is_lost_race(&e) && attempt < MAX_SAVE_ATTEMPTS => {
                    tracing::debug!(booking_id = %request.booking_id, attempt, "Refund lost a race, reloading");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Marks the booking's payment as failed and emits `payment.failed`,
    /// also when no intent exists yet. Captured payments are left alone.
    pub async fn mark_failed(&self, request: FailRequest) -> Result<FailResponse, AppError> {
        request.validate()?;
        let reason = truncate_reason(request.reason.trim());
        if reason.is_empty() {
            return Err(AppError::Validation("reason must not be blank".to_string()));
        }

        let mut attempt = 0;
        loop {
            attempt += 1;

            let Some(intent) = self.store.find_by_booking(request.booking_id).await? else {
                let envelope = failed_event(request.booking_id, None, &reason);
                let event_id = envelope.event_id.clone();
                self.store.record_event(&envelope, EventSource::Internal).await?;
                tracing::info!(booking_id = %request.booking_id, "Payment failure recorded without an intent");
                return Ok(FailResponse {
                    booking_id: request.booking_id,
                    intent_id: None,
                    status: None,
                    reason,
                    event_id,
                });
            };

            if intent.status.is_settled() {
                tracing::warn!(
                    booking_id = %intent.booking_id,
                    status = intent.status.as_str(),
                    "Ignoring failure report for a captured payment"
                );
                return Err(AppError::Conflict(format!(
                    "Payment for booking {} is already {}",
                    intent.booking_id,
                    intent.status.as_str()
                )));
            }

            let mut next = intent.clone();
            next.status = PaymentStatus::Failed;
            next.failure_reason = Some(reason.clone());

            let envelope = failed_event(next.booking_id, Some(&next), &reason);
            let event_id = envelope.event_id.clone();
            match self.store.save(&next, &[envelope]).await {
                Ok(saved) => {
                    tracing::info!(booking_id = %saved.booking_id, intent_id = %saved.id, "Payment marked failed");
                    return Ok(FailResponse {
                        booking_id: saved.booking_id,
                        intent_id: Some(saved.id),
                        status: Some(saved.status),
                        reason,
                        event_id,
                    });
                }
                Err(e) if is_lost_race(&e) && attempt < MAX_SAVE_ATTEMPTS => {
                    tracing::debug!(booking_id = %request.booking_id, attempt, "Failure lost a race, reloading");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Relays a provider notification as the matching internal event. The
    /// provider's event id is kept, so redeliveries are detected by the event
    /// log and published once.
    pub async fn handle_webhook(&self, request: WebhookRequest) -> Result<WebhookResponse, AppError> {
        request.validate()?;

        let booking_id = field_uuid(&request.payload, "bookingId")
            .ok_or_else(|| AppError::Validation("payload.bookingId must be a UUID".to_string()))?;
        let intent = self.store.find_by_booking(booking_id).await?;
        let event = self.webhook_event(&request.event_type, booking_id, &request.payload, intent.as_ref())?;

        let envelope = EventEnvelope::with_id(request.event_id.clone(), WEBHOOK_SOURCE, event);
        envelope.event.validate()?;

        let inserted = self.store.record_event(&envelope, EventSource::Webhook).await?;
        if inserted {
            tracing::info!(event_id = %request.event_id, event_type = %request.event_type, %booking_id, "Webhook accepted");
        } else {
            tracing::debug!(event_id = %request.event_id, "Duplicate webhook delivery");
        }

        Ok(WebhookResponse {
            event_id: request.event_id,
            duplicate: !inserted,
        })
    }

    fn webhook_event(
        &self,
        event_type: &str,
        booking_id: Uuid,
        payload: &Value,
        intent: Option<&PaymentIntent>,
    ) -> Result<DomainEvent, AppError> {
        let now = Utc::now();
        let payer_id = field_uuid(payload, "payerId").or_else(|| intent.and_then(|i| i.payer_id));
        let currency = field_str(payload, "currency")
            .or_else(|| intent.map(|i| i.currency.clone()))
            .unwrap_or_else(|| self.config.default_currency.clone());

        match event_type {
            "payment.captured" => {
                let amount = field_i64(payload, "amount")
                    .or_else(|| intent.map(|i| i.amount))
                    .ok_or_else(|| AppError::Validation("payload.amount is required".to_string()))?;
                let method_type =
                    field_str(payload, "paymentMethodType").or_else(|| intent.and_then(|i| i.payment_method_type.clone()));
                let method_id =
                    field_str(payload, "paymentMethodId").or_else(|| intent.and_then(|i| i.payment_method_id.clone()));
                let hold_id = field_uuid(payload, "holdId")
                    .or_else(|| wallet_hold_id(method_type.as_deref(), method_id.as_deref()));

                Ok(DomainEvent::PaymentCaptured(PaymentCaptured {
                    intent_id: intent.map(|i| i.id),
                    booking_id,
                    payer_id,
                    amount,
                    currency,
                    payment_method_type: method_type,
                    payment_method_id: method_id,
                    payment_provider: field_str(payload, "paymentProvider")
                        .or_else(|| intent.and_then(|i| i.payment_provider.clone())),
                    hold_id,
                    captured_at: now,
                }))
            }
            "payment.failed" => Ok(DomainEvent::PaymentFailed(PaymentFailed {
                intent_id: intent.map(|i| i.id),
                booking_id,
                payer_id,
                reason: field_str(payload, "reason")
                    .map(|reason| truncate_reason(&reason))
                    .unwrap_or_else(|| "Reported failed by payment provider".to_string()),
                failed_at: now,
            })),
            "payment.refunded" => {
                let amount = field_i64(payload, "amount")
                    .or_else(|| intent.map(|i| i.refunded_amount))
                    .ok_or_else(|| AppError::Validation("payload.amount is required".to_string()))?;
                let refunded_total = field_i64(payload, "refundedTotal")
                    .unwrap_or_else(|| intent.map_or(amount, |i| i.refunded_amount.max(amount)));
                let fully_refunded = payload
                    .get("fullyRefunded")
                    .and_then(Value::as_bool)
                    .unwrap_or_else(|| intent.is_some_and(|i| refunded_total >= i.amount));

                Ok(DomainEvent::PaymentRefunded(PaymentRefunded {
                    intent_id: intent.map(|i| i.id),
                    booking_id,
                    payer_id,
                    amount,
                    refunded_total,
                    currency,
                    fully_refunded,
                    reason: field_str(payload, "reason"),
                    refunded_at: now,
                }))
            }
            other => Err(AppError::Validation(format!("Unsupported webhook type '{other}'"))),
        }
    }

    /// Opens a PENDING intent for an upstream `payment.intent` event.
    pub async fn handle_payment_intent(&self, event: &PaymentIntentRequested) -> Result<PaymentIntent, AppError> {
        let (intent, created) = self
            .store
            .create_if_absent(NewPaymentIntent {
                booking_id: event.booking_id,
                payer_id: event.payer_id,
                amount: event.amount,
                currency: event.currency.to_uppercase(),
                idempotency_key: None,
            })
            .await?;

        if created {
            tracing::info!(booking_id = %intent.booking_id, amount = intent.amount, "Opened payment intent");
        } else {
            tracing::debug!(booking_id = %intent.booking_id, "Payment intent already exists");
        }
        Ok(intent)
    }

    pub async fn get_intent(&self, booking_id: Uuid) -> Result<PaymentIntent, AppError> {
        self.find_intent(booking_id).await
    }

    pub async fn events(&self, booking_id: Uuid) -> Result<Vec<PaymentEventRecord>, AppError> {
        self.store.events_for_booking(booking_id).await
    }

    /// Publishes `payment.captured` straight to the bus, bypassing the intent
    /// lifecycle. Development only.
    pub async fn mock_capture(&self, request: MockCaptureRequest) -> Result<MockCaptureResponse, AppError> {
        if !self.config.mock_capture_enabled {
            return Err(AppError::NotFound("Endpoint not found".to_string()));
        }
        request.validate()?;

        let envelope = EventEnvelope::new(
            SERVICE_SOURCE,
            DomainEvent::PaymentCaptured(PaymentCaptured {
                intent_id: None,
                booking_id: request.booking_id,
                payer_id: request.payer_id,
                amount: request.amount,
                currency: request
                    .currency
                    .as_deref()
                    .map(str::to_uppercase)
                    .unwrap_or_else(|| self.config.default_currency.clone()),
                hold_id: wallet_hold_id(request.payment_method_type.as_deref(), request.payment_method_id.as_deref()),
                payment_method_type: request.payment_method_type,
                payment_method_id: request.payment_method_id,
                payment_provider: Some("mock".to_string()),
                captured_at: Utc::now(),
            }),
        );

        let published = publish_best_effort(self.bus.as_ref(), &envelope).await;
        Ok(MockCaptureResponse {
            event_id: envelope.event_id,
            published,
        })
    }

    pub async fn invoice(&self, payer_id: Uuid, month: Option<&str>) -> Result<Invoice, AppError> {
        let window = parse_month(month, Utc::now())?;
        let intents = self.store.list_for_payer(payer_id, window.start, window.end).await?;
        Ok(build_invoice(payer_id, &window, &intents, &self.config.default_currency))
    }

    async fn find_intent(&self, booking_id: Uuid) -> Result<PaymentIntent, AppError> {
        self.store.find_by_booking(booking_id).await?.ok_or_else(|| {
            AppError::rejected(
                ErrorCode::PaymentIntentNotFound,
                format!("No payment intent for booking {booking_id}"),
            )
        })
    }
}

fn captured_event(intent: &PaymentIntent, captured_at: chrono::DateTime<Utc>) -> EventEnvelope {
    EventEnvelope::new(
        SERVICE_SOURCE,
        DomainEvent::PaymentCaptured(PaymentCaptured {
            intent_id: Some(intent.id),
            booking_id: intent.booking_id,
            payer_id: intent.payer_id,
            amount: intent.amount,
            currency: intent.currency.clone(),
            payment_method_type: intent.payment_method_type.clone(),
            payment_method_id: intent.payment_method_id.clone(),
            payment_provider: intent.payment_provider.clone(),
            hold_id: wallet_hold_id(intent.payment_method_type.as_deref(), intent.payment_method_id.as_deref()),
            captured_at,
        }),
    )
}

fn failed_event(booking_id: Uuid, intent: Option<&PaymentIntent>, reason: &str) -> EventEnvelope {
    EventEnvelope::new(
        SERVICE_SOURCE,
        DomainEvent::PaymentFailed(PaymentFailed {
            intent_id: intent.map(|i| i.id),
            booking_id,
            payer_id: intent.and_then(|i| i.payer_id),
            reason: reason.to_string(),
            failed_at: Utc::now(),
        }),
    )
}

/// Wallet payments carry the hold id as the payment method id.
pub fn wallet_hold_id(method_type: Option<&str>, method_id: Option<&str>) -> Option<Uuid> {
    match (method_type, method_id) {
        (Some(kind), Some(id)) if kind.eq_ignore_ascii_case("wallet") => Uuid::parse_str(id).ok(),
        _ => None,
    }
}

fn is_lost_race(error: &AppError) -> bool {
    error.code() == Some(ErrorCode::ConcurrentModification)
}

fn field_str(payload: &Value, name: &str) -> Option<String> {
    payload
        .get(name)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn field_i64(payload: &Value, name: &str) -> Option<i64> {
    payload.get(name).and_then(Value::as_i64)
}

fn field_uuid(payload: &Value, name: &str) -> Option<Uuid> {
    payload.get(name).and_then(Value::as_str).and_then(|value| Uuid::parse_str(value).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hold_ids_come_from_wallet_payments_only() {
        let hold = Uuid::new_v4().to_string();
        assert!(wallet_hold_id(Some("wallet"), Some(&hold)).is_some());
        assert!(wallet_hold_id(Some("WALLET"), Some(&hold)).is_some());
        assert!(wallet_hold_id(Some("card"), Some(&hold)).is_none());
        assert!(wallet_hold_id(Some("wallet"), Some("not-a-uuid")).is_none());
        assert!(wallet_hold_id(None, Some(&hold)).is_none());
    }
}
