use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;
use validator::Validate;

use karigo_common::events::{PaymentCaptured, PaymentFailed};
use karigo_common::{AppError, ErrorCode};

use crate::models::{Booking, BookingStatus, CreateBookingRequest};
use crate::rides::RideClient;
use crate::store::BookingStore;

pub struct BookingService {
    store: Arc<dyn BookingStore>,
    rides: RideClient,
    default_currency: String,
}

impl BookingService {
    pub fn new(store: Arc<dyn BookingStore>, rides: RideClient, default_currency: impl Into<String>) -> Self {
        Self {
            store,
            rides,
            default_currency: default_currency.into(),
        }
    }

    /// Locks seats on the ride, then stores the booking together with its
    /// `payment.intent`. Seats are handed back if the booking cannot be stored.
    pub async fn create_booking(&self, request: CreateBookingRequest) -> Result<Booking, AppError> {
        request.validate()?;

        let booking_id = Uuid::new_v4();
        let lock = self.rides.lock_seats(request.ride_id, booking_id, request.seats).await?;
        tracing::debug!(
            booking_id = %booking_id,
            ride_id = %request.ride_id,
            seats_available = lock.seats_available,
            "Seats locked for booking"
        );

        let now = Utc::now();
        let booking = Booking {
            id: booking_id,
            ride_id: request.ride_id,
            passenger_id: request.passenger_id,
            seats: request.seats,
            amount: request.amount,
            currency: request
                .currency
                .map(|c| c.to_uppercase())
                .unwrap_or_else(|| self.default_currency.clone()),
            status: BookingStatus::PendingPayment,
            created_at: now,
            updated_at: now,
        };

        match self.store.create(&booking).await {
            Ok(stored) => {
                tracing::info!(
                    booking_id = %stored.id,
                    ride_id = %stored.ride_id,
                    amount = stored.amount,
                    "Booking created, awaiting payment"
                );
                Ok(stored)
            }
            Err(e) => {
                tracing::error!(booking_id = %booking_id, error = %e, "Failed to store booking");
                self.rides.release_best_effort(request.ride_id, booking_id).await;
                Err(e)
            }
        }
    }

    pub async fn get_booking(&self, booking_id: Uuid) -> Result<Booking, AppError> {
        self.store.find(booking_id).await?.ok_or_else(|| {
            AppError::rejected(ErrorCode::BookingNotFound, format!("Booking {booking_id} not found"))
        })
    }

    /// Confirms a pending booking. A capture that lands after the booking was
    /// cancelled for a failed attempt re-locks its seats and confirms it.
    pub async fn handle_captured(&self, event: &PaymentCaptured) -> Result<(), AppError> {
        let confirmed = self
            .store
            .transition(event.booking_id, BookingStatus::PendingPayment, BookingStatus::Confirmed)
            .await?;

        if let Some(booking) = confirmed {
            tracing::info!(booking_id = %booking.id, "Booking confirmed");
            return Ok(());
        }

        match self.store.find(event.booking_id).await? {
            Some(booking) if booking.status == BookingStatus::Cancelled => self.reinstate(booking, event).await,
            _ => {
                tracing::debug!(
                    booking_id = %event.booking_id,
                    "Capture for a booking that is not pending payment, ignoring"
                );
                Ok(())
            }
        }
    }

    async fn reinstate(&self, booking: Booking, event: &PaymentCaptured) -> Result<(), AppError> {
        match self.rides.lock_seats(booking.ride_id, booking.id, booking.seats).await {
            Ok(_) => {}
            Err(AppError::Rejected(code, message)) => {
                // Seats are gone; the captured amount has to be refunded.
                tracing::error!(
                    booking_id = %booking.id,
                    ride_id = %booking.ride_id,
                    amount = event.amount,
                    currency = %event.currency,
                    code = %code,
                    reason = %message,
                    "Payment captured for a cancelled booking that cannot be reinstated, refund required"
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let reinstated = self
            .store
            .transition(booking.id, BookingStatus::Cancelled, BookingStatus::Confirmed)
            .await?;

        match reinstated {
            Some(booking) => tracing::warn!(
                booking_id = %booking.id,
                ride_id = %booking.ride_id,
                "Cancelled booking reinstated after a late capture"
            ),
            None => {
                let current = self.store.find(booking.id).await?;
                if current.map(|b| b.status) != Some(BookingStatus::Confirmed) {
                    self.rides.release_best_effort(booking.ride_id, booking.id).await;
                }
            }
        }
        Ok(())
    }

    /// Cancels a pending booking and hands its seats back to the ride.
    pub async fn handle_failed(&self, event: &PaymentFailed) -> Result<(), AppError> {
        let cancelled = self
            .store
            .transition(event.booking_id, BookingStatus::PendingPayment, BookingStatus::Cancelled)
            .await?;

        let Some(booking) = cancelled else {
            tracing::debug!(
                booking_id = %event.booking_id,
                "Payment failure for a booking that is not pending payment, ignoring"
            );
            return Ok(());
        };

        tracing::info!(booking_id = %booking.id, reason = %event.reason, "Booking cancelled after failed payment");
        self.rides.release_best_effort(booking.ride_id, booking.id).await;
        Ok(())
    }
}
