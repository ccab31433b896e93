//! Transactional outbox.
//!
//! Services write the events of a state change into the `outbox` table in the
//! same transaction as the change itself ([`enqueue`]). The [`OutboxRelay`]
//! then publishes pending rows to the event bus in insertion order and marks
//! them published. A row whose publish fails stays pending and is retried on
//! the next poll; later rows with the same partition key wait behind it.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{types::Json, FromRow, PgConnection, PgPool};
use tokio::sync::watch;
use uuid::Uuid;

use karigo_common::events::EventEnvelope;
use karigo_common::{AppError, EventBus, OutboxConfig};

/// Rows claimed longer ago than this are assumed abandoned by a crashed relay.
const CLAIM_TIMEOUT: Duration = Duration::from_secs(60);

/// Advisory lock id held while a relay claims a batch.
const RELAY_LOCK_ID: i64 = 0x6b61_7269_676f;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    InFlight,
    Published,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::InFlight => "in_flight",
            OutboxStatus::Published => "published",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OutboxStatus::Pending),
            "in_flight" => Some(OutboxStatus::InFlight),
            "published" => Some(OutboxStatus::Published),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutboxMessage {
    pub seq: i64,
    pub id: Uuid,
    pub topic: String,
    pub partition_key: String,
    pub envelope: EventEnvelope,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct OutboxRow {
    seq: i64,
    id: Uuid,
    topic: String,
    partition_key: String,
    payload: Json<EventEnvelope>,
    attempts: i32,
    created_at: DateTime<Utc>,
}

impl From<OutboxRow> for OutboxMessage {
    fn from(row: OutboxRow) -> Self {
        Self {
            seq: row.seq,
            id: row.id,
            topic: row.topic,
            partition_key: row.partition_key,
            envelope: row.payload.0,
            attempts: row.attempts,
            created_at: row.created_at,
        }
    }
}

/// Adds `envelope` to the outbox on the caller's connection, normally inside
/// the transaction that made the change it describes.
pub async fn enqueue(conn: &mut PgConnection, envelope: &EventEnvelope) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO outbox (id, topic, partition_key, payload)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(envelope.topic())
    .bind(envelope.partition_key())
    .bind(Json(envelope))
    .execute(conn)
    .await?;
    Ok(())
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Claims up to `limit` unpublished messages in insertion order, skipping
    /// partitions that already have a message in flight.
    async fn claim(&self, limit: i64) -> Result<Vec<OutboxMessage>, AppError>;

    async fn mark_published(&self, seq: i64) -> Result<(), AppError>;

    /// Returns a claimed message to the pending set. `error` is recorded as
    /// a failed attempt; `None` releases it untouched.
    async fn release(&self, seq: i64, error: Option<&str>) -> Result<(), AppError>;

    /// Deletes rows published more than `older_than` ago and returns how many.
    async fn prune_published(&self, older_than: Duration) -> Result<u64, AppError>;
}

pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn claim(&self, limit: i64) -> Result<Vec<OutboxMessage>, AppError> {
        let mut tx = self.pool.begin().await?;

        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_xact_lock($1)")
            .bind(RELAY_LOCK_ID)
            .fetch_one(&mut *tx)
            .await?;
        if !locked {
            return Ok(Vec::new());
        }

        let rows: Vec<OutboxRow> = sqlx::query_as(
            r#"
            UPDATE outbox SET status = 'in_flight', claimed_at = NOW()
            WHERE seq IN (
                SELECT o.seq FROM outbox o
                WHERE (o.status = 'pending'
                       OR (o.status = 'in_flight' AND o.claimed_at < NOW() - make_interval(secs => $2)))
                  AND NOT EXISTS (
                      SELECT 1 FROM outbox f
                      WHERE f.partition_key = o.partition_key
                        AND f.status = 'in_flight'
                        AND f.claimed_at >= NOW() - make_interval(secs => $2)
                  )
                ORDER BY o.seq
                LIMIT $1
            )
            RETURNING seq, id, topic, partition_key, payload, attempts, created_at
            "#,
        )
        .bind(limit)
        .bind(CLAIM_TIMEOUT.as_secs_f64())
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        let mut messages: Vec<OutboxMessage> = rows.into_iter().map(OutboxMessage::from).collect();
        messages.sort_by_key(|m| m.seq);
        Ok(messages)
    }

    async fn mark_published(&self, seq: i64) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE outbox SET status = 'published', published_at = NOW(), attempts = attempts + 1 WHERE seq = $1",
        )
        .bind(seq)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn release(&self, seq: i64, error: Option<&str>) -> Result<(), AppError> {
        match error {
            Some(error) => {
                sqlx::query(
                    r#"
                    UPDATE outbox
                    SET status = 'pending', claimed_at = NULL, attempts = attempts + 1, last_error = $2
                    WHERE seq = $1
                    "#,
                )
                .bind(seq)
                .bind(error)
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query("UPDATE outbox SET status = 'pending', claimed_at = NULL WHERE seq = $1")
                    .bind(seq)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    async fn prune_published(&self, older_than: Duration) -> Result<u64, AppError> {
        let result = sqlx::query(
            "DELETE FROM outbox WHERE status = 'published' AND published_at < NOW() - make_interval(secs => $1)",
        )
        .bind(older_than.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, Clone)]
struct MemoryRow {
    message: OutboxMessage,
    status: OutboxStatus,
    last_error: Option<String>,
    published_at: Option<DateTime<Utc>>,
}

/// Outbox kept in process memory, for the in-memory service stores and
/// tests. Enqueue it under the same lock as the state change.
#[derive(Default)]
pub struct InMemoryOutboxStore {
    rows: Mutex<Vec<MemoryRow>>,
    last_seq: AtomicI64,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, envelope: &EventEnvelope) {
        let mut rows = self.rows.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let seq = self.last_seq.fetch_add(1, Ordering::SeqCst) + 1;
        rows.push(MemoryRow {
            message: OutboxMessage {
                seq,
                id: Uuid::new_v4(),
                topic: envelope.topic(),
                partition_key: envelope.partition_key(),
                envelope: envelope.clone(),
                attempts: 0,
                created_at: Utc::now(),
            },
            status: OutboxStatus::Pending,
            last_error: None,
            published_at: None,
        });
    }

    pub fn pending(&self) -> usize {
        self.rows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|row| row.status != OutboxStatus::Published)
            .count()
    }

    /// Every enqueued envelope on `topic`, published or not.
    pub fn enqueued(&self, topic: &str) -> Vec<EventEnvelope> {
        self.rows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|row| row.message.topic == topic)
            .map(|row| row.message.envelope.clone())
            .collect()
    }

    pub fn last_error(&self, seq: i64) -> Option<String> {
        self.rows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .find(|row| row.message.seq == seq)
            .and_then(|row| row.last_error.clone())
    }

    fn update(&self, seq: i64, apply: impl FnOnce(&mut MemoryRow)) {
        let mut rows = self.rows.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(row) = rows.iter_mut().find(|row| row.message.seq == seq) {
            apply(row);
        }
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn claim(&self, limit: i64) -> Result<Vec<OutboxMessage>, AppError> {
        let mut rows = self.rows.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let busy: HashSet<String> = rows
            .iter()
            .filter(|row| row.status == OutboxStatus::InFlight)
            .map(|row| row.message.partition_key.clone())
            .collect();

        let mut claimed = Vec::new();
        for row in rows.iter_mut() {
            if claimed.len() as i64 >= limit {
                break;
            }
            if row.status == OutboxStatus::Pending && !busy.contains(&row.message.partition_key) {
                row.status = OutboxStatus::InFlight;
                claimed.push(row.message.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_published(&self, seq: i64) -> Result<(), AppError> {
        self.update(seq, |row| {
            row.status = OutboxStatus::Published;
            row.published_at = Some(Utc::now());
            row.message.attempts += 1;
        });
        Ok(())
    }

    async fn release(&self, seq: i64, error: Option<&str>) -> Result<(), AppError> {
        self.update(seq, |row| {
            row.status = OutboxStatus::Pending;
            if let Some(error) = error {
                row.message.attempts += 1;
                row.last_error = Some(error.to_string());
            }
        });
        Ok(())
    }

    async fn prune_published(&self, older_than: Duration) -> Result<u64, AppError> {
        let older_than = chrono::Duration::from_std(older_than)
            .map_err(|e| AppError::Validation(format!("retention out of range: {e}")))?;
        let cutoff = Utc::now() - older_than;

        let mut rows = self.rows.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = rows.len();
        rows.retain(|row| !matches!(row.published_at, Some(at) if at < cutoff));
        Ok((before - rows.len()) as u64)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayReport {
    pub published: usize,
    pub failed: usize,
    /// Messages held back because an earlier message of their partition failed.
    pub deferred: usize,
}

pub struct OutboxRelay {
    store: Arc<dyn OutboxStore>,
    bus: Arc<dyn EventBus>,
    config: OutboxConfig,
}

impl OutboxRelay {
    pub fn new(store: Arc<dyn OutboxStore>, bus: Arc<dyn EventBus>, config: OutboxConfig) -> Self {
        Self { store, bus, config }
    }

    /// Polls until shutdown, then flushes one last batch.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.poll_interval());
        tracing::info!(poll_ms = self.config.poll_interval_ms, "Outbox relay started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        self.tick().await;
                        break;
                    }
                }
                _ = interval.tick() => self.tick().await,
            }
        }

        tracing::info!("Outbox relay stopped");
    }

    async fn tick(&self) {
        match self.process_batch().await {
            Ok(report) if report.failed > 0 => {
                tracing::warn!(
                    published = report.published,
                    failed = report.failed,
                    deferred = report.deferred,
                    "Outbox batch partially published"
                );
            }
            Ok(report) if report.published > 0 => {
                tracing::debug!(published = report.published, "Outbox batch published");
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "Outbox relay poll failed"),
        }
    }

    pub async fn process_batch(&self) -> Result<RelayReport, AppError> {
        let batch = self.store.claim(self.config.batch_size).await?;
        let mut report = RelayReport::default();
        let mut blocked: HashSet<String> = HashSet::new();

        for message in batch {
            if blocked.contains(&message.partition_key) {
                self.store.release(message.seq, None).await?;
                report.deferred += 1;
                continue;
            }

            match self
                .bus
                .publish(&message.topic, &message.envelope, Some(&message.partition_key))
                .await
            {
                Ok(()) => {
                    self.store.mark_published(message.seq).await?;
                    report.published += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        topic = %message.topic,
                        event_id = %message.envelope.event_id,
                        attempts = message.attempts + 1,
                        error = %e,
                        "Outbox publish failed"
                    );
                    self.store.release(message.seq, Some(&e.to_string())).await?;
                    blocked.insert(message.partition_key.clone());
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }
}
