//! Typed events exchanged between services.
//!
//! Every message on the bus is an [`EventEnvelope`] whose `event` field is a
//! [`DomainEvent`], serialized as `{"type": "<topic>", "data": {...}}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::AppError;

pub mod topics {
    pub const PAYMENT_INTENT: &str = "payment.intent";
    pub const PAYMENT_CAPTURED: &str = "payment.captured";
    pub const PAYMENT_REFUNDED: &str = "payment.refunded";
    pub const PAYMENT_FAILED: &str = "payment.failed";
    pub const RIDE_PUBLISHED: &str = "ride.published";
    pub const RIDE_UPDATED: &str = "ride.updated";

    pub const DEAD_LETTER_SUFFIX: &str = ".dlq";

    pub fn dead_letter(topic: &str) -> String {
        format!("{topic}{DEAD_LETTER_SUFFIX}")
    }

    pub fn is_dead_letter(topic: &str) -> bool {
        topic.ends_with(DEAD_LETTER_SUFFIX)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentIntentRequested {
    pub booking_id: Uuid,
    pub payer_id: Option<Uuid>,
    pub amount: i64,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentCaptured {
    pub intent_id: Option<Uuid>,
    pub booking_id: Uuid,
    pub payer_id: Option<Uuid>,
    pub amount: i64,
    pub currency: String,
    pub payment_method_type: Option<String>,
    pub payment_method_id: Option<String>,
    pub payment_provider: Option<String>,
    /// Wallet hold settled by this capture, when paid from a wallet.
    pub hold_id: Option<Uuid>,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRefunded {
    pub intent_id: Option<Uuid>,
    pub booking_id: Uuid,
    pub payer_id: Option<Uuid>,
    /// Amount refunded by this operation.
    pub amount: i64,
    /// Running total refunded on the intent.
    pub refunded_total: i64,
    pub currency: String,
    pub fully_refunded: bool,
    pub reason: Option<String>,
    pub refunded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentFailed {
    pub intent_id: Option<Uuid>,
    pub booking_id: Uuid,
    pub payer_id: Option<Uuid>,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RidePublished {
    pub ride_id: Uuid,
    pub driver_id: Uuid,
    pub origin: String,
    pub destination: String,
    pub departure_at: DateTime<Utc>,
    pub seats_available: i32,
    pub price_per_seat: i64,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RideUpdated {
    pub ride_id: Uuid,
    pub seats_available: i32,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub topic: String,
    pub reason: String,
    pub error: String,
    pub attempts: u32,
    pub original: Box<EventEnvelope>,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum DomainEvent {
    #[serde(rename = "payment.intent")]
    PaymentIntent(PaymentIntentRequested),
    #[serde(rename = "payment.captured")]
    PaymentCaptured(PaymentCaptured),
    #[serde(rename = "payment.refunded")]
    PaymentRefunded(PaymentRefunded),
    #[serde(rename = "payment.failed")]
    PaymentFailed(PaymentFailed),
    #[serde(rename = "ride.published")]
    RidePublished(RidePublished),
    #[serde(rename = "ride.updated")]
    RideUpdated(RideUpdated),
    #[serde(rename = "dead_letter")]
    DeadLetter(DeadLetter),
}

impl DomainEvent {
    /// Topic the event is published on.
    pub fn topic(&self) -> String {
        match self {
            DomainEvent::PaymentIntent(_) => topics::PAYMENT_INTENT.to_string(),
            DomainEvent::PaymentCaptured(_) => topics::PAYMENT_CAPTURED.to_string(),
            DomainEvent::PaymentRefunded(_) => topics::PAYMENT_REFUNDED.to_string(),
            DomainEvent::PaymentFailed(_) => topics::PAYMENT_FAILED.to_string(),
            DomainEvent::RidePublished(_) => topics::RIDE_PUBLISHED.to_string(),
            DomainEvent::RideUpdated(_) => topics::RIDE_UPDATED.to_string(),
            DomainEvent::DeadLetter(letter) => topics::dead_letter(&letter.topic),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            DomainEvent::PaymentIntent(_) => topics::PAYMENT_INTENT,
            DomainEvent::PaymentCaptured(_) => topics::PAYMENT_CAPTURED,
            DomainEvent::PaymentRefunded(_) => topics::PAYMENT_REFUNDED,
            DomainEvent::PaymentFailed(_) => topics::PAYMENT_FAILED,
            DomainEvent::RidePublished(_) => topics::RIDE_PUBLISHED,
            DomainEvent::RideUpdated(_) => topics::RIDE_UPDATED,
            DomainEvent::DeadLetter(_) => "dead_letter",
        }
    }

    /// Id of the entity the event is about, used as the partition key.
    pub fn natural_key(&self) -> Option<String> {
        match self {
            DomainEvent::PaymentIntent(e) => Some(e.booking_id.to_string()),
            DomainEvent::PaymentCaptured(e) => Some(e.booking_id.to_string()),
            DomainEvent::PaymentRefunded(e) => Some(e.booking_id.to_string()),
            DomainEvent::PaymentFailed(e) => Some(e.booking_id.to_string()),
            DomainEvent::RidePublished(e) => Some(e.ride_id.to_string()),
            DomainEvent::RideUpdated(e) => Some(e.ride_id.to_string()),
            DomainEvent::DeadLetter(letter) => letter.original.event.natural_key(),
        }
    }

    /// Schema checks that serde cannot express.
    pub fn validate(&self) -> Result<(), AppError> {
        let fail = |message: &str| Err(AppError::Validation(format!("{}: {}", self.type_name(), message)));

        match self {
            DomainEvent::PaymentIntent(e) => {
                if e.amount <= 0 {
                    return fail("amount must be positive");
                }
                if e.currency.trim().is_empty() {
                    return fail("currency is required");
                }
            }
            DomainEvent::PaymentCaptured(e) => {
                if e.amount <= 0 {
                    return fail("amount must be positive");
                }
            }
            DomainEvent::PaymentRefunded(e) => {
                if e.amount <= 0 || e.refunded_total < e.amount {
                    return fail("refund amounts are inconsistent");
                }
            }
            DomainEvent::PaymentFailed(e) => {
                if e.reason.trim().is_empty() {
                    return fail("reason is required");
                }
            }
            DomainEvent::RidePublished(e) => {
                if e.seats_available < 0 || e.price_per_seat < 0 {
                    return fail("seats and price must not be negative");
                }
            }
            DomainEvent::RideUpdated(e) => {
                if e.seats_available < 0 {
                    return fail("seats must not be negative");
                }
            }
            DomainEvent::DeadLetter(_) => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event_id: String,
    pub occurred_at: DateTime<Utc>,
    pub source: String,
    pub event: DomainEvent,
}

impl EventEnvelope {
    pub fn new(source: &str, event: DomainEvent) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), source, event)
    }

    pub fn with_id(event_id: impl Into<String>, source: &str, event: DomainEvent) -> Self {
        Self {
            event_id: event_id.into(),
            occurred_at: Utc::now(),
            source: source.to_string(),
            event,
        }
    }

    pub fn topic(&self) -> String {
        self.event.topic()
    }

    /// Natural id of the event's entity, or the event id when it has none.
    pub fn partition_key(&self) -> String {
        self.event
            .natural_key()
            .unwrap_or_else(|| self.event_id.clone())
    }

    pub fn encode(&self) -> Result<String, AppError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses and validates a message taken off the bus.
    pub fn decode(payload: &str) -> Result<Self, AppError> {
        let envelope: EventEnvelope = serde_json::from_str(payload)
            .map_err(|e| AppError::Validation(format!("Malformed event envelope: {e}")))?;
        envelope.event.validate()?;
        Ok(envelope)
    }
}
