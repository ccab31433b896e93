use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;
use validator::Validate;

use karigo_common::AppError;

use crate::models::{
    CreateRideRequest, LockResponse, LockSeatsRequest, Ride, RideStatus, UnlockResponse, UnlockSeatsRequest,
};
use crate::store::{ride_not_found, RideStore};

pub struct RideService {
    store: Arc<dyn RideStore>,
    default_currency: String,
}

impl RideService {
    pub fn new(store: Arc<dyn RideStore>, default_currency: impl Into<String>) -> Self {
        Self {
            store,
            default_currency: default_currency.into(),
        }
    }

    pub async fn create_ride(&self, request: CreateRideRequest) -> Result<Ride, AppError> {
        request.validate()?;
        if request.origin.trim().eq_ignore_ascii_case(request.destination.trim()) {
            return Err(AppError::Validation("Origin and destination must differ".to_string()));
        }

        let now = Utc::now();
        let ride = Ride {
            id: Uuid::new_v4(),
            driver_id: request.driver_id,
            origin: request.origin.trim().to_string(),
            destination: request.destination.trim().to_string(),
            departure_at: request.departure_at,
            seats_total: request.seats_total,
            seats_available: request.seats_total,
            price_per_seat: request.price_per_seat,
            currency: request
                .currency
                .map(|c| c.to_uppercase())
                .unwrap_or_else(|| self.default_currency.clone()),
            status: if request.publish {
                RideStatus::Published
            } else {
                RideStatus::Draft
            },
            created_at: now,
            updated_at: now,
        };

        let ride = self.store.create(&ride).await?;
        tracing::info!(ride_id = %ride.id, driver_id = %ride.driver_id, status = ride.status.as_str(), "Ride created");
        Ok(ride)
    }

    pub async fn get_ride(&self, ride_id: Uuid) -> Result<Ride, AppError> {
        self.store.find(ride_id).await?.ok_or_else(|| ride_not_found(ride_id))
    }

    pub async fn publish_ride(&self, ride_id: Uuid) -> Result<Ride, AppError> {
        self.store.publish(ride_id).await
    }

    pub async fn lock_seats(&self, ride_id: Uuid, request: LockSeatsRequest) -> Result<LockResponse, AppError> {
        request.validate()?;
        let outcome = self.store.lock_seats(ride_id, request.booking_id, request.seats).await?;

        if outcome.already_locked {
            tracing::debug!(ride_id = %ride_id, booking_id = %request.booking_id, "Seat lock already held");
        }

        Ok(LockResponse {
            ride_id,
            booking_id: outcome.lock.booking_id,
            seats: outcome.lock.seats,
            seats_available: outcome.ride.seats_available,
            already_locked: outcome.already_locked,
        })
    }

    pub async fn unlock_seats(&self, ride_id: Uuid, request: UnlockSeatsRequest) -> Result<UnlockResponse, AppError> {
        let outcome = self.store.unlock_seats(ride_id, request.booking_id).await?;
        Ok(UnlockResponse {
            ride_id,
            booking_id: request.booking_id,
            released_seats: outcome.released_seats,
            seats_available: outcome.ride.seats_available,
        })
    }
}
