use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{types::Json, FromRow, PgConnection, PgPool};
use uuid::Uuid;

use karigo_common::events::EventEnvelope;
use karigo_common::{AppError, ErrorCode};
use karigo_database::enqueue;

use crate::idempotency::{IdempotencyStore, ReserveOutcome};
use crate::models::{
    EventSource, IdempotencyRecord, IdempotencyStatus, NewPaymentIntent, PaymentEventRecord, PaymentIntent,
    PaymentOperationResponse, PaymentStatus, VelocitySubject,
};
use crate::store::{event_record, PaymentStore};

const INTENT_COLUMNS: &str = "id, booking_id, payer_id, amount, currency, status, payment_method_type, \
     payment_method_id, payment_provider, idempotency_key, failure_reason, refunded_amount, captured_at, \
     refunded_at, version, created_at, updated_at";

#[derive(FromRow)]
struct IntentRow {
    id: Uuid,
    booking_id: Uuid,
    payer_id: Option<Uuid>,
    amount: i64,
    currency: String,
    status: String,
    payment_method_type: Option<String>,
    payment_method_id: Option<String>,
    payment_provider: Option<String>,
    idempotency_key: Option<String>,
    failure_reason: Option<String>,
    refunded_amount: i64,
    captured_at: Option<DateTime<Utc>>,
    refunded_at: Option<DateTime<Utc>>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<IntentRow> for PaymentIntent {
    type Error = AppError;

    fn try_from(row: IntentRow) -> Result<Self, Self::Error> {
        Ok(PaymentIntent {
            id: row.id,
            booking_id: row.booking_id,
            payer_id: row.payer_id,
            amount: row.amount,
            currency: row.currency,
            status: PaymentStatus::parse(&row.status)?,
            payment_method_type: row.payment_method_type,
            payment_method_id: row.payment_method_id,
            payment_provider: row.payment_provider,
            idempotency_key: row.idempotency_key,
            failure_reason: row.failure_reason,
            refunded_amount: row.refunded_amount,
            captured_at: row.captured_at,
            refunded_at: row.refunded_at,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct EventRow {
    event_id: String,
    event_type: String,
    booking_id: Option<Uuid>,
    source: String,
    payload: serde_json::Value,
    processed_at: DateTime<Utc>,
}

impl From<EventRow> for PaymentEventRecord {
    fn from(row: EventRow) -> Self {
        Self {
            event_id: row.event_id,
            event_type: row.event_type,
            booking_id: row.booking_id,
            source: row.source,
            payload: row.payload,
            processed_at: row.processed_at,
        }
    }
}

#[derive(Clone)]
pub struct PgPaymentStore {
    pool: PgPool,
}

impl PgPaymentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Logs the event and enqueues it, unless its id is already logged.
    async fn append_event(
        conn: &mut PgConnection,
        envelope: &EventEnvelope,
        source: EventSource,
    ) -> Result<bool, AppError> {
        let record = event_record(envelope, source)?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO payment_events (event_id, event_type, booking_id, source, payload)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(&record.event_id)
        .bind(&record.event_type)
        .bind(record.booking_id)
        .bind(&record.source)
        .bind(&record.payload)
        .execute(&mut *conn)
        .await?
        .rows_affected()
            == 1;

        if inserted {
            enqueue(conn, envelope).await?;
        }
        Ok(inserted)
    }
}

#[async_trait]
impl PaymentStore for PgPaymentStore {
    async fn create_if_absent(&self, new: NewPaymentIntent) -> Result<(PaymentIntent, bool), AppError> {
        let intent = new.into_intent();
        let created = sqlx::query(
            r#"
            INSERT INTO payment_intents (id, booking_id, payer_id, amount, currency, status, idempotency_key)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (booking_id) DO NOTHING
            "#,
        )
        .bind(intent.id)
        .bind(intent.booking_id)
        .bind(intent.payer_id)
        .bind(intent.amount)
        .bind(&intent.currency)
        .bind(intent.status.as_str())
        .bind(&intent.idempotency_key)
        .execute(&self.pool)
        .await?
        .rows_affected()
            == 1;

        let stored = self
            .find_by_booking(intent.booking_id)
            .await?
            .ok_or_else(|| AppError::Internal("payment intent vanished after insert".to_string()))?;

        if created {
            tracing::info!(booking_id = %stored.booking_id, intent_id = %stored.id, "Payment intent created");
        }
        Ok((stored, created))
    }

    async fn find_by_booking(&self, booking_id: Uuid) -> Result<Option<PaymentIntent>, AppError> {
        let row: Option<IntentRow> =
            sqlx::query_as(&format!("SELECT {INTENT_COLUMNS} FROM payment_intents WHERE booking_id = $1"))
                .bind(booking_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(PaymentIntent::try_from).transpose()
    }

    async fn save(&self, intent: &PaymentIntent, events: &[EventEnvelope]) -> Result<PaymentIntent, AppError> {
        let mut tx = self.pool.begin().await?;

        let row: Option<IntentRow> = sqlx::query_as(&format!(
            r#"
            UPDATE payment_intents
            SET payer_id = $3, status = $4, payment_method_type = $5, payment_method_id = $6,
                payment_provider = $7, idempotency_key = $8, failure_reason = $9, refunded_amount = $10,
                captured_at = $11, refunded_at = $12, version = version + 1, updated_at = NOW()
            WHERE id = $1 AND version = $2
            RETURNING {INTENT_COLUMNS}
            "#
        ))
        .bind(intent.id)
        .bind(intent.version)
        .bind(intent.payer_id)
        .bind(intent.status.as_str())
        .bind(&intent.payment_method_type)
        .bind(&intent.payment_method_id)
        .bind(&intent.payment_provider)
        .bind(&intent.idempotency_key)
        .bind(&intent.failure_reason)
        .bind(intent.refunded_amount)
        .bind(intent.captured_at)
        .bind(intent.refunded_at)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Err(AppError::rejected(
                ErrorCode::ConcurrentModification,
                "Payment intent was modified concurrently",
            ));
        };

        for envelope in events {
            Self::append_event(&mut tx, envelope, EventSource::Internal).await?;
        }

        tx.commit().await?;
        PaymentIntent::try_from(row)
    }

    async fn record_event(&self, envelope: &EventEnvelope, source: EventSource) -> Result<bool, AppError> {
        let mut tx = self.pool.begin().await?;
        let inserted = Self::append_event(&mut tx, envelope, source).await?;
        tx.commit().await?;
        Ok(inserted)
    }

    async fn count_created_since(&self, subject: VelocitySubject, since: DateTime<Utc>) -> Result<i64, AppError> {
        let (column, id) = match subject {
            VelocitySubject::Payer(id) => ("payer_id", id),
            VelocitySubject::Booking(id) => ("booking_id", id),
        };
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM payment_intents WHERE {column} = $1 AND created_at >= $2"
        ))
        .bind(id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn list_for_payer(
        &self,
        payer_id: Uuid,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<PaymentIntent>, AppError> {
        let rows: Vec<IntentRow> = sqlx::query_as(&format!(
            "SELECT {INTENT_COLUMNS} FROM payment_intents \
             WHERE payer_id = $1 AND created_at >= $2 AND created_at < $3 ORDER BY created_at"
        ))
        .bind(payer_id)
        .bind(from)
        .bind(until)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(PaymentIntent::try_from).collect()
    }

    async fn events_for_booking(&self, booking_id: Uuid) -> Result<Vec<PaymentEventRecord>, AppError> {
        let rows: Vec<EventRow> = sqlx::query_as(
            r#"
            SELECT event_id, event_type, booking_id, source, payload, processed_at
            FROM payment_events WHERE booking_id = $1 ORDER BY processed_at
            "#,
        )
        .bind(booking_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(PaymentEventRecord::from).collect())
    }
}

#[derive(FromRow)]
struct IdempotencyRow {
    key: String,
    operation: String,
    request_hash: String,
    status: String,
    response: Option<Json<PaymentOperationResponse>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<IdempotencyRow> for IdempotencyRecord {
    type Error = AppError;

    fn try_from(row: IdempotencyRow) -> Result<Self, Self::Error> {
        Ok(IdempotencyRecord {
            key: row.key,
            operation: row.operation,
            request_hash: row.request_hash,
            status: IdempotencyStatus::parse(&row.status)?,
            response: row.response.map(|json| json.0),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Clone)]
pub struct PgIdempotencyStore {
    pool: PgPool,
}

impl PgIdempotencyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdempotencyStore for PgIdempotencyStore {
    async fn reserve(
        &self,
        key: &str,
        operation: &str,
        request_hash: &str,
        stale_after: Duration,
    ) -> Result<ReserveOutcome, AppError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO idempotency_records (key, operation, request_hash, status)
            VALUES ($1, $2, $3, 'pending')
            ON CONFLICT (key) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(operation)
        .bind(request_hash)
        .execute(&self.pool)
        .await?
        .rows_affected()
            == 1;
        if inserted {
            return Ok(ReserveOutcome::Reserved);
        }

        let taken_over = sqlx::query(
            r#"
            UPDATE idempotency_records SET updated_at = NOW()
            WHERE key = $1 AND status = 'pending' AND request_hash = $2
              AND updated_at < NOW() - make_interval(secs => $3)
            "#,
        )
        .bind(key)
        .bind(request_hash)
        .bind(stale_after.as_secs_f64())
        .execute(&self.pool)
        .await?
        .rows_affected()
            == 1;
        if taken_over {
            tracing::warn!(idempotency_key = key, "Took over an abandoned idempotency reservation");
            return Ok(ReserveOutcome::Reserved);
        }

        match self.find(key).await? {
            Some(record) => Ok(ReserveOutcome::Existing(record)),
            // Released between our insert and read; let the caller retry.
            None => Err(AppError::rejected(
                ErrorCode::IdempotencyRequestInProgress,
                "A request with this idempotency key is still being processed",
            )),
        }
    }

    async fn complete(
        &self,
        key: &str,
        status: IdempotencyStatus,
        response: &PaymentOperationResponse,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE idempotency_records SET status = $2, response = $3, updated_at = NOW()
            WHERE key = $1 AND status = 'pending'
            "#,
        )
        .bind(key)
        .bind(status.as_str())
        .bind(Json(response))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn release(&self, key: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM idempotency_records WHERE key = $1 AND status = 'pending'")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find(&self, key: &str) -> Result<Option<IdempotencyRecord>, AppError> {
        let row: Option<IdempotencyRow> = sqlx::query_as(
            r#"
            SELECT key, operation, request_hash, status, response, created_at, updated_at
            FROM idempotency_records WHERE key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(IdempotencyRecord::try_from).transpose()
    }
}
