use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use karigo_common::events::{DomainEvent, EventEnvelope};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    PaymentCaptured,
    PaymentRefunded,
    PaymentFailed,
}

impl NotificationKind {
    /// Name of the template rendering this kind.
    pub fn template(&self) -> &'static str {
        match self {
            NotificationKind::PaymentCaptured => "payment_captured",
            NotificationKind::PaymentRefunded => "payment_refunded",
            NotificationKind::PaymentFailed => "payment_failed",
        }
    }
}

/// What the notifier is asked to deliver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub event_id: String,
    pub kind: NotificationKind,
    pub recipient_id: Option<Uuid>,
    pub booking_id: Uuid,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// A payment outcome, with the values its template needs.
#[derive(Debug, Clone)]
pub struct PaymentNotice {
    pub kind: NotificationKind,
    pub recipient_id: Option<Uuid>,
    pub booking_id: Uuid,
    pub data: serde_json::Value,
}

impl PaymentNotice {
    /// None for events that do not concern the payer.
    pub fn from_envelope(envelope: &EventEnvelope) -> Option<Self> {
        let notice = match &envelope.event {
            DomainEvent::PaymentCaptured(e) => Self {
                kind: NotificationKind::PaymentCaptured,
                recipient_id: e.payer_id,
                booking_id: e.booking_id,
                data: json!({
                    "bookingId": e.booking_id,
                    "amount": format_amount(e.amount),
                    "currency": e.currency,
                }),
            },
            DomainEvent::PaymentRefunded(e) => Self {
                kind: NotificationKind::PaymentRefunded,
                recipient_id: e.payer_id,
                booking_id: e.booking_id,
                data: json!({
                    "bookingId": e.booking_id,
                    "amount": format_amount(e.amount),
                    "currency": e.currency,
                    "fullyRefunded": e.fully_refunded,
                    "reason": e.reason,
                }),
            },
            DomainEvent::PaymentFailed(e) => Self {
                kind: NotificationKind::PaymentFailed,
                recipient_id: e.payer_id,
                booking_id: e.booking_id,
                data: json!({
                    "bookingId": e.booking_id,
                    "reason": e.reason,
                }),
            },
            _ => return None,
        };
        Some(notice)
    }
}

/// Minor units as a decimal string, e.g. 1250 -> "12.50".
pub fn format_amount(minor: i64) -> String {
    let sign = if minor < 0 { "-" } else { "" };
    let minor = minor.unsigned_abs();
    format!("{sign}{}.{:02}", minor / 100, minor % 100)
}
