use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use karigo_common::events::{DomainEvent, EventEnvelope, PaymentIntentRequested};
use karigo_common::AppError;

pub const SERVICE_SOURCE: &str = "booking-service";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    PendingPayment,
    Confirmed,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::PendingPayment => "pending_payment",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self, AppError> {
        match s {
            "pending_payment" => Ok(BookingStatus::PendingPayment),
            "confirmed" => Ok(BookingStatus::Confirmed),
            "cancelled" => Ok(BookingStatus::Cancelled),
            other => Err(AppError::Internal(format!("Unknown booking status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Booking {
    pub id: Uuid,
    pub ride_id: Uuid,
    pub passenger_id: Uuid,
    pub seats: i32,
    pub amount: i64,
    pub currency: String,
    pub status: BookingStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    /// Asks the payment service to open an intent for this booking.
    pub fn intent_event(&self) -> EventEnvelope {
        EventEnvelope::new(
            SERVICE_SOURCE,
            DomainEvent::PaymentIntent(PaymentIntentRequested {
                booking_id: self.id,
                payer_id: Some(self.passenger_id),
                amount: self.amount,
                currency: self.currency.clone(),
            }),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateBookingRequest {
    pub ride_id: Uuid,
    pub passenger_id: Uuid,
    #[validate(range(min = 1, max = 50))]
    pub seats: i32,
    #[validate(range(min = 1))]
    pub amount: i64,
    #[validate(length(equal = 3))]
    pub currency: Option<String>,
}

/// Body of the ride service's lock call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeatLockCall {
    pub booking_id: Uuid,
    pub seats: i32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeatUnlockCall {
    pub booking_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeatLockReply {
    pub ride_id: Uuid,
    pub booking_id: Uuid,
    pub seats: i32,
    pub seats_available: i32,
    #[serde(default)]
    pub already_locked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeatUnlockReply {
    pub released_seats: i32,
    pub seats_available: i32,
}
