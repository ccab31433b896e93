use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgConnection, PgPool};
use uuid::Uuid;

use karigo_common::{AppError, ErrorCode};
use karigo_database::enqueue;

use crate::models::{Ride, RideStatus, SeatLock};
use crate::store::{lock_rejection, ride_not_found, RideStore, SeatLockOutcome, SeatReleaseOutcome};

const RIDE_COLUMNS: &str = "id, driver_id, origin, destination, departure_at, seats_total, seats_available, \
     price_per_seat, currency, status, created_at, updated_at";

#[derive(FromRow)]
struct RideRow {
    id: Uuid,
    driver_id: Uuid,
    origin: String,
    destination: String,
    departure_at: DateTime<Utc>,
    seats_total: i32,
    seats_available: i32,
    price_per_seat: i64,
    currency: String,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RideRow> for Ride {
    type Error = AppError;

    fn try_from(row: RideRow) -> Result<Self, Self::Error> {
        Ok(Ride {
            id: row.id,
            driver_id: row.driver_id,
            origin: row.origin,
            destination: row.destination,
            departure_at: row.departure_at,
            seats_total: row.seats_total,
            seats_available: row.seats_available,
            price_per_seat: row.price_per_seat,
            currency: row.currency,
            status: RideStatus::parse(&row.status)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct LockRow {
    ride_id: Uuid,
    booking_id: Uuid,
    seats: i32,
    created_at: DateTime<Utc>,
}

impl From<LockRow> for SeatLock {
    fn from(row: LockRow) -> Self {
        Self {
            ride_id: row.ride_id,
            booking_id: row.booking_id,
            seats: row.seats,
            created_at: row.created_at,
        }
    }
}

#[derive(Clone)]
pub struct PgRideStore {
    pool: PgPool,
}

impl PgRideStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn find_in(conn: &mut PgConnection, ride_id: Uuid) -> Result<Option<Ride>, AppError> {
        let row: Option<RideRow> = sqlx::query_as(&format!("SELECT {RIDE_COLUMNS} FROM rides WHERE id = $1"))
            .bind(ride_id)
            .fetch_optional(&mut *conn)
            .await?;
        row.map(Ride::try_from).transpose()
    }

    async fn find_lock(conn: &mut PgConnection, ride_id: Uuid, booking_id: Uuid) -> Result<Option<SeatLock>, AppError> {
        let row: Option<LockRow> = sqlx::query_as(
            "SELECT ride_id, booking_id, seats, created_at FROM seat_locks WHERE ride_id = $1 AND booking_id = $2",
        )
        .bind(ride_id)
        .bind(booking_id)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(row.map(SeatLock::from))
    }
}

#[async_trait]
impl RideStore for PgRideStore {
    async fn create(&self, ride: &Ride) -> Result<Ride, AppError> {
        let mut tx = self.pool.begin().await?;

        let row: RideRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO rides (id, driver_id, origin, destination, departure_at, seats_total, seats_available,
                               price_per_seat, currency, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {RIDE_COLUMNS}
            "#
        ))
        .bind(ride.id)
        .bind(ride.driver_id)
        .bind(&ride.origin)
        .bind(&ride.destination)
        .bind(ride.departure_at)
        .bind(ride.seats_total)
        .bind(ride.seats_available)
        .bind(ride.price_per_seat)
        .bind(&ride.currency)
        .bind(ride.status.as_str())
        .fetch_one(&mut *tx)
        .await?;
        let stored = Ride::try_from(row)?;

        if stored.status == RideStatus::Published {
            enqueue(&mut tx, &stored.published_event()).await?;
        }

        tx.commit().await?;
        Ok(stored)
    }

    async fn find(&self, ride_id: Uuid) -> Result<Option<Ride>, AppError> {
        let mut conn = self.pool.acquire().await?;
        Self::find_in(&mut conn, ride_id).await
    }

    async fn publish(&self, ride_id: Uuid) -> Result<Ride, AppError> {
        let mut tx = self.pool.begin().await?;

        let row: Option<RideRow> = sqlx::query_as(&format!(
            r#"
            UPDATE rides SET status = 'published', updated_at = NOW()
            WHERE id = $1 AND status = 'draft'
            RETURNING {RIDE_COLUMNS}
            "#
        ))
        .bind(ride_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            let current = Self::find_in(&mut tx, ride_id).await?.ok_or_else(|| ride_not_found(ride_id))?;
            return match current.status {
                RideStatus::Published => Ok(current),
                _ => Err(AppError::rejected(
                    ErrorCode::RideNotBookable,
                    format!("Ride {ride_id} is {}", current.status.as_str()),
                )),
            };
        };

        let ride = Ride::try_from(row)?;
        enqueue(&mut tx, &ride.published_event()).await?;
        tx.commit().await?;

        tracing::info!(ride_id = %ride.id, "Ride published");
        Ok(ride)
    }

    async fn lock_seats(&self, ride_id: Uuid, booking_id: Uuid, seats: i32) -> Result<SeatLockOutcome, AppError> {
        let mut tx = self.pool.begin().await?;

        if let Some(existing) = Self::find_lock(&mut tx, ride_id, booking_id).await? {
            let ride = Self::find_in(&mut tx, ride_id).await?.ok_or_else(|| ride_not_found(ride_id))?;
            return Ok(SeatLockOutcome {
                ride,
                lock: existing,
                already_locked: true,
            });
        }

        // The guard in the WHERE clause keeps seats_available from going negative.
        let row: Option<RideRow> = sqlx::query_as(&format!(
            r#"
            UPDATE rides SET seats_available = seats_available - $2, updated_at = NOW()
            WHERE id = $1 AND status = 'published' AND seats_available >= $2
            RETURNING {RIDE_COLUMNS}
            "#
        ))
        .bind(ride_id)
        .bind(seats)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            let current = Self::find_in(&mut tx, ride_id).await?;
            return Err(lock_rejection(ride_id, current.as_ref(), seats));
        };
        let ride = Ride::try_from(row)?;

        let lock: Option<LockRow> = sqlx::query_as(
            r#"
            INSERT INTO seat_locks (ride_id, booking_id, seats)
            VALUES ($1, $2, $3)
            ON CONFLICT (ride_id, booking_id) DO NOTHING
            RETURNING ride_id, booking_id, seats, created_at
            "#,
        )
        .bind(ride_id)
        .bind(booking_id)
        .bind(seats)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(lock) = lock else {
            // A concurrent lock for the same booking won; undo our decrement.
            tx.rollback().await?;
            let mut conn = self.pool.acquire().await?;
            let existing = Self::find_lock(&mut conn, ride_id, booking_id)
                .await?
                .ok_or_else(|| AppError::Internal("seat lock vanished after conflict".to_string()))?;
            let ride = Self::find_in(&mut conn, ride_id).await?.ok_or_else(|| ride_not_found(ride_id))?;
            return Ok(SeatLockOutcome {
                ride,
                lock: existing,
                already_locked: true,
            });
        };

        enqueue(&mut tx, &ride.updated_event()).await?;
        tx.commit().await?;

        tracing::info!(
            ride_id = %ride_id,
            booking_id = %booking_id,
            seats,
            seats_available = ride.seats_available,
            "Seats locked"
        );
        Ok(SeatLockOutcome {
            ride,
            lock: lock.into(),
            already_locked: false,
        })
    }

    async fn unlock_seats(&self, ride_id: Uuid, booking_id: Uuid) -> Result<SeatReleaseOutcome, AppError> {
        let mut tx = self.pool.begin().await?;

        let released: Option<i32> = sqlx::query_scalar(
            "DELETE FROM seat_locks WHERE ride_id = $1 AND booking_id = $2 RETURNING seats",
        )
        .bind(ride_id)
        .bind(booking_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(seats) = released else {
            let ride = Self::find_in(&mut tx, ride_id).await?.ok_or_else(|| ride_not_found(ride_id))?;
            return Ok(SeatReleaseOutcome {
                ride,
                released_seats: 0,
            });
        };

        let row: RideRow = sqlx::query_as(&format!(
            r#"
            UPDATE rides SET seats_available = LEAST(seats_available + $2, seats_total), updated_at = NOW()
            WHERE id = $1
            RETURNING {RIDE_COLUMNS}
            "#
        ))
        .bind(ride_id)
        .bind(seats)
        .fetch_one(&mut *tx)
        .await?;
        let ride = Ride::try_from(row)?;

        enqueue(&mut tx, &ride.updated_event()).await?;
        tx.commit().await?;

        tracing::info!(ride_id = %ride_id, booking_id = %booking_id, seats, "Seats released");
        Ok(SeatReleaseOutcome {
            ride,
            released_seats: seats,
        })
    }
}
