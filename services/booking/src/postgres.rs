use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use karigo_common::AppError;
use karigo_database::enqueue;

use crate::models::{Booking, BookingStatus};
use crate::store::BookingStore;

const BOOKING_COLUMNS: &str = "id, ride_id, passenger_id, seats, amount, currency, status, created_at, updated_at";

#[derive(FromRow)]
struct BookingRow {
    id: Uuid,
    ride_id: Uuid,
    passenger_id: Uuid,
    seats: i32,
    amount: i64,
    currency: String,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<BookingRow> for Booking {
    type Error = AppError;

    fn try_from(row: BookingRow) -> Result<Self, Self::Error> {
        Ok(Booking {
            id: row.id,
            ride_id: row.ride_id,
            passenger_id: row.passenger_id,
            seats: row.seats,
            amount: row.amount,
            currency: row.currency,
            status: BookingStatus::parse(&row.status)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Clone)]
pub struct PgBookingStore {
    pool: PgPool,
}

impl PgBookingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BookingStore for PgBookingStore {
    async fn create(&self, booking: &Booking) -> Result<Booking, AppError> {
        let mut tx = self.pool.begin().await?;

        let row: BookingRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO bookings (id, ride_id, passenger_id, seats, amount, currency, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {BOOKING_COLUMNS}
            "#
        ))
        .bind(booking.id)
        .bind(booking.ride_id)
        .bind(booking.passenger_id)
        .bind(booking.seats)
        .bind(booking.amount)
        .bind(&booking.currency)
        .bind(booking.status.as_str())
        .fetch_one(&mut *tx)
        .await?;
        let stored = Booking::try_from(row)?;

        enqueue(&mut tx, &stored.intent_event()).await?;
        tx.commit().await?;
        Ok(stored)
    }

    async fn find(&self, booking_id: Uuid) -> Result<Option<Booking>, AppError> {
        let row: Option<BookingRow> = sqlx::query_as(&format!("SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = $1"))
            .bind(booking_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Booking::try_from).transpose()
    }

    async fn transition(
        &self,
        booking_id: Uuid,
        from: BookingStatus,
        to: BookingStatus,
    ) -> Result<Option<Booking>, AppError> {
        let row: Option<BookingRow> = sqlx::query_as(&format!(
            r#"
            UPDATE bookings SET status = $3, updated_at = NOW()
            WHERE id = $1 AND status = $2
            RETURNING {BOOKING_COLUMNS}
            "#
        ))
        .bind(booking_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Booking::try_from).transpose()
    }
}
