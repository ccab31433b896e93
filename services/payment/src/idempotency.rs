//! Idempotency ledger for capture and refund.
//!
//! A request that carries an `Idempotency-Key` first reserves the key with a
//! PENDING record holding the request fingerprint. The operation's response is
//! then stored on the record; replays with the same fingerprint get that
//! response back without side effects, replays with a different fingerprint
//! are rejected. A failed operation releases its reservation so the client can
//! retry with the same key.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};

use karigo_common::{AppError, ErrorCode};

use crate::models::{IdempotencyRecord, IdempotencyStatus, PaymentOperationResponse};

/// A PENDING record older than this is treated as abandoned.
pub const PENDING_TIMEOUT: Duration = Duration::from_secs(30);

/// Rewrites `value` with every object's keys in sorted order.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = serde_json::Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// SHA-256 over the canonical JSON of `{operation, body}`, hex encoded.
pub fn fingerprint(operation: &str, body: &Value) -> String {
    let canonical = canonicalize(&serde_json::json!({ "operation": operation, "body": body }));
    let digest = Sha256::digest(canonical.to_string().as_bytes());
    hex::encode(digest)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    Reserved,
    Existing(IdempotencyRecord),
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Inserts a PENDING record unless the key exists. An existing PENDING
    /// record older than `stale_after` with the same fingerprint is taken over.
    async fn reserve(
        &self,
        key: &str,
        operation: &str,
        request_hash: &str,
        stale_after: Duration,
    ) -> Result<ReserveOutcome, AppError>;

    async fn complete(
        &self,
        key: &str,
        status: IdempotencyStatus,
        response: &PaymentOperationResponse,
    ) -> Result<(), AppError>;

    /// Deletes a PENDING reservation; completed records are kept.
    async fn release(&self, key: &str) -> Result<(), AppError>;

    async fn find(&self, key: &str) -> Result<Option<IdempotencyRecord>, AppError>;
}

#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    records: Mutex<HashMap<String, IdempotencyRecord>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn reserve(
        &self,
        key: &str,
        operation: &str,
        request_hash: &str,
        stale_after: Duration,
    ) -> Result<ReserveOutcome, AppError> {
        let mut records = self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Utc::now();

        if let Some(existing) = records.get_mut(key) {
            let stale = existing.status == IdempotencyStatus::Pending
                && existing.request_hash == request_hash
                && (now - existing.updated_at).to_std().unwrap_or_default() >= stale_after;
            if !stale {
                return Ok(ReserveOutcome::Existing(existing.clone()));
            }
            existing.updated_at = now;
            return Ok(ReserveOutcome::Reserved);
        }

        records.insert(
            key.to_string(),
            IdempotencyRecord {
                key: key.to_string(),
                operation: operation.to_string(),
                request_hash: request_hash.to_string(),
                status: IdempotencyStatus::Pending,
                response: None,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(ReserveOutcome::Reserved)
    }

    async fn complete(
        &self,
        key: &str,
        status: IdempotencyStatus,
        response: &PaymentOperationResponse,
    ) -> Result<(), AppError> {
        let mut records = self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(record) = records.get_mut(key) {
            if record.status == IdempotencyStatus::Pending {
                record.status = status;
                record.response = Some(response.clone());
                record.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn release(&self, key: &str) -> Result<(), AppError> {
        let mut records = self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if records
            .get(key)
            .is_some_and(|record| record.status == IdempotencyStatus::Pending)
        {
            records.remove(key);
        }
        Ok(())
    }

    async fn find(&self, key: &str) -> Result<Option<IdempotencyRecord>, AppError> {
        let records = self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(records.get(key).cloned())
    }
}

/// A key reserved by [`IdempotencyLedger::check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub key: String,
    pub request_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Run the operation; `None` when the request carried no key.
    Proceed(Option<Reservation>),
    /// Return this response unchanged.
    Replay(PaymentOperationResponse),
}

pub struct IdempotencyLedger {
    store: Arc<dyn IdempotencyStore>,
    pending_timeout: Duration,
}

impl IdempotencyLedger {
    pub fn new(store: Arc<dyn IdempotencyStore>) -> Self {
        Self {
            store,
            pending_timeout: PENDING_TIMEOUT,
        }
    }

    pub async fn check(
        &self,
        key: Option<&str>,
        operation: &str,
        payload: &Value,
    ) -> Result<Admission, AppError> {
        let Some(key) = key else {
            return Ok(Admission::Proceed(None));
        };

        let request_hash = fingerprint(operation, payload);
        match self
            .store
            .reserve(key, operation, &request_hash, self.pending_timeout)
            .await?
        {
            ReserveOutcome::Reserved => Ok(Admission::Proceed(Some(Reservation {
                key: key.to_string(),
                request_hash,
            }))),
            ReserveOutcome::Existing(record) if record.request_hash != request_hash => {
                tracing::warn!(idempotency_key = key, operation, "Idempotency key reused with a different request");
                Err(AppError::rejected(
                    ErrorCode::IdempotencyKeyConflict,
                    "Idempotency key was already used for a different request",
                ))
            }
            ReserveOutcome::Existing(record) => match record.response {
                Some(response) if record.status != IdempotencyStatus::Pending => {
                    tracing::debug!(idempotency_key = key, operation, "Replaying cached response");
                    Ok(Admission::Replay(response))
                }
                _ => Err(AppError::rejected(
                    ErrorCode::IdempotencyRequestInProgress,
                    "A request with this idempotency key is still being processed",
                )),
            },
        }
    }

    /// Stores the outcome of the operation admitted under `reservation`.
    pub async fn save(
        &self,
        reservation: &Reservation,
        response: &PaymentOperationResponse,
        status: IdempotencyStatus,
    ) -> Result<(), AppError> {
        self.store.complete(&reservation.key, status, response).await
    }

    /// Records a successful outcome, or frees the key after a failure.
    pub async fn finish(
        &self,
        reservation: Option<Reservation>,
        outcome: Result<(PaymentOperationResponse, IdempotencyStatus), AppError>,
    ) -> Result<PaymentOperationResponse, AppError> {
        let Some(reservation) = reservation else {
            return outcome.map(|(response, _)| response);
        };

        match outcome {
            Ok((response, status)) => {
                if let Err(e) = self.save(&reservation, &response, status).await {
                    // The operation already committed.
                    tracing::error!(idempotency_key = %reservation.key, error = %e, "Failed to record idempotent response");
                }
                Ok(response)
            }
            Err(err) => {
                if let Err(e) = self.store.release(&reservation.key).await {
                    tracing::warn!(idempotency_key = %reservation.key, error = %e, "Failed to release idempotency key");
                }
                Err(err)
            }
        }
    }
}
