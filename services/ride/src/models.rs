use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use karigo_common::events::{DomainEvent, EventEnvelope, RidePublished, RideUpdated};
use karigo_common::AppError;

pub const SERVICE_SOURCE: &str = "ride-service";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RideStatus {
    Draft,
    Published,
    Cancelled,
}

impl RideStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RideStatus::Draft => "draft",
            RideStatus::Published => "published",
            RideStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self, AppError> {
        match s {
            "draft" => Ok(RideStatus::Draft),
            "published" => Ok(RideStatus::Published),
            "cancelled" => Ok(RideStatus::Cancelled),
            other => Err(AppError::Internal(format!("Unknown ride status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ride {
    pub id: Uuid,
    pub driver_id: Uuid,
    pub origin: String,
    pub destination: String,
    pub departure_at: DateTime<Utc>,
    pub seats_total: i32,
    pub seats_available: i32,
    pub price_per_seat: i64,
    pub currency: String,
    pub status: RideStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Ride {
    pub fn published_event(&self) -> EventEnvelope {
        EventEnvelope::new(
            SERVICE_SOURCE,
            DomainEvent::RidePublished(RidePublished {
                ride_id: self.id,
                driver_id: self.driver_id,
                origin: self.origin.clone(),
                destination: self.destination.clone(),
                departure_at: self.departure_at,
                seats_available: self.seats_available,
                price_per_seat: self.price_per_seat,
                currency: self.currency.clone(),
            }),
        )
    }

    pub fn updated_event(&self) -> EventEnvelope {
        EventEnvelope::new(
            SERVICE_SOURCE,
            DomainEvent::RideUpdated(RideUpdated {
                ride_id: self.id,
                seats_available: self.seats_available,
                status: self.status.as_str().to_string(),
            }),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeatLock {
    pub ride_id: Uuid,
    pub booking_id: Uuid,
    pub seats: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateRideRequest {
    pub driver_id: Uuid,
    #[validate(length(min = 1, max = 200))]
    pub origin: String,
    #[validate(length(min = 1, max = 200))]
    pub destination: String,
    pub departure_at: DateTime<Utc>,
    #[validate(range(min = 1, max = 50))]
    pub seats_total: i32,
    #[validate(range(min = 0))]
    pub price_per_seat: i64,
    #[validate(length(equal = 3))]
    pub currency: Option<String>,
    /// Publish right away instead of leaving the ride as a draft.
    #[serde(default)]
    pub publish: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct LockSeatsRequest {
    pub booking_id: Uuid,
    #[validate(range(min = 1, max = 50))]
    pub seats: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnlockSeatsRequest {
    pub booking_id: Uuid,
}

/// Result of a lock call; `already_locked` marks a repeated lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockResponse {
    pub ride_id: Uuid,
    pub booking_id: Uuid,
    pub seats: i32,
    pub seats_available: i32,
    pub already_locked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnlockResponse {
    pub ride_id: Uuid,
    pub booking_id: Uuid,
    pub released_seats: i32,
    pub seats_available: i32,
}
