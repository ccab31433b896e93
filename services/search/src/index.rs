use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use karigo_common::AppError;

use crate::models::{SearchDocument, SearchQuery, PUBLISHED};

pub const MAX_RESULTS: i64 = 50;

#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn upsert(&self, doc: &SearchDocument) -> Result<(), AppError>;

    /// Updates availability of an indexed ride. False when the ride is not indexed.
    async fn update_availability(&self, ride_id: Uuid, seats_available: i32, status: &str) -> Result<bool, AppError>;

    /// Bookable documents matching `query`, soonest departure first.
    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchDocument>, AppError>;
}

#[derive(Default)]
pub struct InMemorySearchIndex {
    docs: RwLock<HashMap<Uuid, SearchDocument>>,
    failures_left: AtomicUsize,
    writes: AtomicUsize,
}

impl InMemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every write fail until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.fail_next(if failing { usize::MAX } else { 0 });
    }

    /// Fails the next `writes` writes.
    pub fn fail_next(&self, writes: usize) {
        self.failures_left.store(writes, Ordering::SeqCst);
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn get(&self, ride_id: Uuid) -> Option<SearchDocument> {
        self.docs
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&ride_id)
            .cloned()
    }

    fn check_available(&self) -> Result<(), AppError> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(AppError::Internal("search index unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SearchIndex for InMemorySearchIndex {
    async fn upsert(&self, doc: &SearchDocument) -> Result<(), AppError> {
        self.check_available()?;
        self.docs
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(doc.ride_id, doc.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn update_availability(&self, ride_id: Uuid, seats_available: i32, status: &str) -> Result<bool, AppError> {
        self.check_available()?;
        let mut docs = self.docs.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(doc) = docs.get_mut(&ride_id) else {
            return Ok(false);
        };
        doc.seats_available = seats_available;
        doc.status = status.to_string();
        doc.indexed_at = Utc::now();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchDocument>, AppError> {
        let docs = self.docs.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut hits: Vec<SearchDocument> = docs
            .values()
            .filter(|doc| doc.is_bookable() && query.matches(doc))
            .cloned()
            .collect();
        hits.sort_by_key(|doc| doc.departure_at);
        hits.truncate(MAX_RESULTS as usize);
        Ok(hits)
    }
}

#[derive(FromRow)]
struct DocumentRow {
    ride_id: Uuid,
    driver_id: Uuid,
    origin: String,
    destination: String,
    departure_at: DateTime<Utc>,
    seats_available: i32,
    price_per_seat: i64,
    currency: String,
    status: String,
    indexed_at: DateTime<Utc>,
}

impl From<DocumentRow> for SearchDocument {
    fn from(row: DocumentRow) -> Self {
        Self {
            ride_id: row.ride_id,
            driver_id: row.driver_id,
            origin: row.origin,
            destination: row.destination,
            departure_at: row.departure_at,
            seats_available: row.seats_available,
            price_per_seat: row.price_per_seat,
            currency: row.currency,
            status: row.status,
            indexed_at: row.indexed_at,
        }
    }
}

#[derive(Clone)]
pub struct PgSearchIndex {
    pool: PgPool,
}

impl PgSearchIndex {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SearchIndex for PgSearchIndex {
    async fn upsert(&self, doc: &SearchDocument) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO ride_search_index (ride_id, driver_id, origin, destination, departure_at,
                                           seats_available, price_per_seat, currency, status, indexed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
            ON CONFLICT (ride_id) DO UPDATE SET
                driver_id = EXCLUDED.driver_id,
                origin = EXCLUDED.origin,
                destination = EXCLUDED.destination,
                departure_at = EXCLUDED.departure_at,
                seats_available = EXCLUDED.seats_available,
                price_per_seat = EXCLUDED.price_per_seat,
                currency = EXCLUDED.currency,
                status = EXCLUDED.status,
                indexed_at = NOW()
            "#,
        )
        .bind(doc.ride_id)
        .bind(doc.driver_id)
        .bind(&doc.origin)
        .bind(&doc.destination)
        .bind(doc.departure_at)
        .bind(doc.seats_available)
        .bind(doc.price_per_seat)
        .bind(&doc.currency)
        .bind(&doc.status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_availability(&self, ride_id: Uuid, seats_available: i32, status: &str) -> Result<bool, AppError> {
        let updated = sqlx::query(
            r#"
            UPDATE ride_search_index SET seats_available = $2, status = $3, indexed_at = NOW()
            WHERE ride_id = $1
            "#,
        )
        .bind(ride_id)
        .bind(seats_available)
        .bind(status)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated == 1)
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchDocument>, AppError> {
        let normalize = |value: &Option<String>| {
            value
                .as_deref()
                .map(|v| v.trim().to_lowercase())
                .filter(|v| !v.is_empty())
        };

        let rows: Vec<DocumentRow> = sqlx::query_as(
            r#"
            SELECT ride_id, driver_id, origin, destination, departure_at, seats_available,
                   price_per_seat, currency, status, indexed_at
            FROM ride_search_index
            WHERE status = $1 AND seats_available > 0
              AND ($2::TEXT IS NULL OR lower(origin) = $2)
              AND ($3::TEXT IS NULL OR lower(destination) = $3)
            ORDER BY departure_at
            LIMIT $4
            "#,
        )
        .bind(PUBLISHED)
        .bind(normalize(&query.origin))
        .bind(normalize(&query.destination))
        .bind(MAX_RESULTS)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(SearchDocument::from).collect())
    }
}
