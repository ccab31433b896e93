use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use karigo_common::AppError;

use crate::models::{HoldStatus, WalletHold};
use crate::store::HoldStore;

const HOLD_COLUMNS: &str =
    "id, user_id, booking_id, amount, currency, status, captured_at, released_at, created_at, updated_at";

#[derive(FromRow)]
struct HoldRow {
    id: Uuid,
    user_id: Uuid,
    booking_id: Uuid,
    amount: i64,
    currency: String,
    status: String,
    captured_at: Option<DateTime<Utc>>,
    released_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<HoldRow> for WalletHold {
    type Error = AppError;

    fn try_from(row: HoldRow) -> Result<Self, Self::Error> {
        Ok(WalletHold {
            id: row.id,
            user_id: row.user_id,
            booking_id: row.booking_id,
            amount: row.amount,
            currency: row.currency,
            status: HoldStatus::parse(&row.status)?,
            captured_at: row.captured_at,
            released_at: row.released_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Clone)]
pub struct PgHoldStore {
    pool: PgPool,
}

impl PgHoldStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HoldStore for PgHoldStore {
    async fn create(&self, hold: &WalletHold) -> Result<WalletHold, AppError> {
        let row: HoldRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO wallet_holds (id, user_id, booking_id, amount, currency, status)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {HOLD_COLUMNS}
            "#
        ))
        .bind(hold.id)
        .bind(hold.user_id)
        .bind(hold.booking_id)
        .bind(hold.amount)
        .bind(&hold.currency)
        .bind(hold.status.as_str())
        .fetch_one(&self.pool)
        .await?;
        WalletHold::try_from(row)
    }

    async fn find(&self, hold_id: Uuid) -> Result<Option<WalletHold>, AppError> {
        let row: Option<HoldRow> = sqlx::query_as(&format!("SELECT {HOLD_COLUMNS} FROM wallet_holds WHERE id = $1"))
            .bind(hold_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(WalletHold::try_from).transpose()
    }

    async fn capture(&self, hold_id: Uuid, booking_id: Uuid) -> Result<Option<WalletHold>, AppError> {
        let row: Option<HoldRow> = sqlx::query_as(&format!(
            r#"
            UPDATE wallet_holds SET status = 'captured', captured_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND booking_id = $2 AND status = 'held'
            RETURNING {HOLD_COLUMNS}
            "#
        ))
        .bind(hold_id)
        .bind(booking_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(WalletHold::try_from).transpose()
    }

    async fn release_for_booking(&self, booking_id: Uuid) -> Result<Vec<WalletHold>, AppError> {
        let rows: Vec<HoldRow> = sqlx::query_as(&format!(
            r#"
            UPDATE wallet_holds SET status = 'released', released_at = NOW(), updated_at = NOW()
            WHERE booking_id = $1 AND status = 'held'
            RETURNING {HOLD_COLUMNS}
            "#
        ))
        .bind(booking_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(WalletHold::try_from).collect()
    }
}
