use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use karigo_common::{AppError, ErrorCode};
use karigo_database::InMemoryOutboxStore;

use crate::models::{Ride, RideStatus, SeatLock};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeatLockOutcome {
    pub ride: Ride,
    pub lock: SeatLock,
    pub already_locked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeatReleaseOutcome {
    pub ride: Ride,
    /// 0 when the booking held no lock.
    pub released_seats: i32,
}

/// Rides and their seat locks. Every change that emits an event enqueues it
/// in the outbox atomically with the change.
#[async_trait]
pub trait RideStore: Send + Sync {
    /// Stores a new ride, emitting `ride.published` when it is created published.
    async fn create(&self, ride: &Ride) -> Result<Ride, AppError>;

    async fn find(&self, ride_id: Uuid) -> Result<Option<Ride>, AppError>;

    /// Moves a draft to published and emits `ride.published`. Publishing a
    /// published ride returns it unchanged.
    async fn publish(&self, ride_id: Uuid) -> Result<Ride, AppError>;

    /// Takes `seats` seats for `booking_id` if that many are free. Locking a
    /// booking twice returns the first lock.
    async fn lock_seats(&self, ride_id: Uuid, booking_id: Uuid, seats: i32) -> Result<SeatLockOutcome, AppError>;

    /// Returns a booking's seats. Unknown locks are a no-op.
    async fn unlock_seats(&self, ride_id: Uuid, booking_id: Uuid) -> Result<SeatReleaseOutcome, AppError>;
}

/// Explains why a conditional seat decrement matched no row.
pub fn lock_rejection(ride_id: Uuid, ride: Option<&Ride>, seats: i32) -> AppError {
    match ride {
        None => AppError::rejected(ErrorCode::RideNotFound, format!("Ride {ride_id} not found")),
        Some(ride) if ride.status != RideStatus::Published => AppError::rejected(
            ErrorCode::RideNotBookable,
            format!("Ride {} is {}", ride.id, ride.status.as_str()),
        ),
        Some(ride) => AppError::rejected(
            ErrorCode::InsufficientSeats,
            format!("Requested {} seats, {} available", seats, ride.seats_available),
        ),
    }
}

pub fn ride_not_found(ride_id: Uuid) -> AppError {
    AppError::rejected(ErrorCode::RideNotFound, format!("Ride {ride_id} not found"))
}

#[derive(Default)]
struct Tables {
    rides: HashMap<Uuid, Ride>,
    locks: HashMap<(Uuid, Uuid), SeatLock>,
}

/// Process-memory store. The single lock makes each operation atomic.
pub struct InMemoryRideStore {
    tables: Mutex<Tables>,
    outbox: Arc<InMemoryOutboxStore>,
}

impl InMemoryRideStore {
    pub fn new(outbox: Arc<InMemoryOutboxStore>) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            outbox,
        }
    }

    pub fn lock_count(&self, ride_id: Uuid) -> usize {
        self.lock().locks.keys().filter(|(ride, _)| *ride == ride_id).count()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl RideStore for InMemoryRideStore {
    async fn create(&self, ride: &Ride) -> Result<Ride, AppError> {
        let mut tables = self.lock();
        if tables.rides.contains_key(&ride.id) {
            return Err(AppError::Conflict(format!("Ride {} already exists", ride.id)));
        }
        tables.rides.insert(ride.id, ride.clone());
        if ride.status == RideStatus::Published {
            self.outbox.enqueue(&ride.published_event());
        }
        Ok(ride.clone())
    }

    async fn find(&self, ride_id: Uuid) -> Result<Option<Ride>, AppError> {
        Ok(self.lock().rides.get(&ride_id).cloned())
    }

    async fn publish(&self, ride_id: Uuid) -> Result<Ride, AppError> {
        let mut tables = self.lock();
        let ride = tables.rides.get_mut(&ride_id).ok_or_else(|| ride_not_found(ride_id))?;
        match ride.status {
            RideStatus::Published => Ok(ride.clone()),
            RideStatus::Cancelled => Err(AppError::rejected(
                ErrorCode::RideNotBookable,
                format!("Ride {ride_id} is cancelled"),
            )),
            RideStatus::Draft => {
                ride.status = RideStatus::Published;
                ride.updated_at = Utc::now();
                self.outbox.enqueue(&ride.published_event());
                Ok(ride.clone())
            }
        }
    }

    async fn lock_seats(&self, ride_id: Uuid, booking_id: Uuid, seats: i32) -> Result<SeatLockOutcome, AppError> {
        let mut tables = self.lock();

        if let Some(existing) = tables.locks.get(&(ride_id, booking_id)).cloned() {
            let ride = tables.rides.get(&ride_id).cloned().ok_or_else(|| ride_not_found(ride_id))?;
            return Ok(SeatLockOutcome {
                ride,
                lock: existing,
                already_locked: true,
            });
        }

        let ride = match tables.rides.get_mut(&ride_id) {
            Some(ride) if ride.status == RideStatus::Published && ride.seats_available >= seats => ride,
            other => return Err(lock_rejection(ride_id, other.map(|r| &*r), seats)),
        };
        ride.seats_available -= seats;
        ride.updated_at = Utc::now();
        let ride = ride.clone();

        let lock = SeatLock {
            ride_id,
            booking_id,
            seats,
            created_at: Utc::now(),
        };
        tables.locks.insert((ride_id, booking_id), lock.clone());
        self.outbox.enqueue(&ride.updated_event());

        Ok(SeatLockOutcome {
            ride,
            lock,
            already_locked: false,
        })
    }

    async fn unlock_seats(&self, ride_id: Uuid, booking_id: Uuid) -> Result<SeatReleaseOutcome, AppError> {
        let mut tables = self.lock();
        let removed = tables.locks.remove(&(ride_id, booking_id));
        let ride = tables.rides.get_mut(&ride_id).ok_or_else(|| ride_not_found(ride_id))?;

        let Some(lock) = removed else {
            return Ok(SeatReleaseOutcome {
                ride: ride.clone(),
                released_seats: 0,
            });
        };

        ride.seats_available = (ride.seats_available + lock.seats).min(ride.seats_total);
        ride.updated_at = Utc::now();
        let ride = ride.clone();
        self.outbox.enqueue(&ride.updated_event());

        Ok(SeatReleaseOutcome {
            ride,
            released_seats: lock.seats,
        })
    }
}
