use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use karigo_common::AppError;
use karigo_database::InMemoryOutboxStore;

use crate::models::{Booking, BookingStatus};

#[async_trait]
pub trait BookingStore: Send + Sync {
    /// Stores a new booking and enqueues its `payment.intent` in the same write.
    async fn create(&self, booking: &Booking) -> Result<Booking, AppError>;

    async fn find(&self, booking_id: Uuid) -> Result<Option<Booking>, AppError>;

    /// Moves the booking to `to` only while it is in `from`. `None` when the
    /// booking is missing or in another state.
    async fn transition(
        &self,
        booking_id: Uuid,
        from: BookingStatus,
        to: BookingStatus,
    ) -> Result<Option<Booking>, AppError>;
}

pub struct InMemoryBookingStore {
    bookings: Mutex<HashMap<Uuid, Booking>>,
    outbox: Arc<InMemoryOutboxStore>,
}

impl InMemoryBookingStore {
    pub fn new(outbox: Arc<InMemoryOutboxStore>) -> Self {
        Self {
            bookings: Mutex::new(HashMap::new()),
            outbox,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Booking>> {
        self.bookings.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl BookingStore for InMemoryBookingStore {
    async fn create(&self, booking: &Booking) -> Result<Booking, AppError> {
        let mut bookings = self.lock();
        if bookings.contains_key(&booking.id) {
            return Err(AppError::Conflict(format!("Booking {} already exists", booking.id)));
        }
        bookings.insert(booking.id, booking.clone());
        self.outbox.enqueue(&booking.intent_event());
        Ok(booking.clone())
    }

    async fn find(&self, booking_id: Uuid) -> Result<Option<Booking>, AppError> {
        Ok(self.lock().get(&booking_id).cloned())
    }

    async fn transition(
        &self,
        booking_id: Uuid,
        from: BookingStatus,
        to: BookingStatus,
    ) -> Result<Option<Booking>, AppError> {
        let mut bookings = self.lock();
        match bookings.get_mut(&booking_id) {
            Some(booking) if booking.status == from => {
                booking.status = to;
                booking.updated_at = Utc::now();
                Ok(Some(booking.clone()))
            }
            _ => Ok(None),
        }
    }
}
