use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use karigo_common::events::EventEnvelope;
use karigo_common::{AppError, ErrorCode};
use karigo_database::InMemoryOutboxStore;

use crate::models::{EventSource, NewPaymentIntent, PaymentEventRecord, PaymentIntent, VelocitySubject};

/// Persistence of intents and the payment event log.
///
/// Every write that emits events appends them to the event log and the
/// outbox atomically with the state change.
#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Returns the intent of the booking, creating it from `new` when none
    /// exists. The flag is true when this call created it.
    async fn create_if_absent(&self, new: NewPaymentIntent) -> Result<(PaymentIntent, bool), AppError>;

    async fn find_by_booking(&self, booking_id: Uuid) -> Result<Option<PaymentIntent>, AppError>;

    /// Writes `intent` if the stored version still equals `intent.version`,
    /// bumping the version. A lost race fails with `concurrent_modification`.
    async fn save(&self, intent: &PaymentIntent, events: &[EventEnvelope]) -> Result<PaymentIntent, AppError>;

    /// Appends an event that changes no intent. False when the event id was
    /// already logged, in which case nothing is enqueued.
    async fn record_event(&self, envelope: &EventEnvelope, source: EventSource) -> Result<bool, AppError>;

    async fn count_created_since(&self, subject: VelocitySubject, since: DateTime<Utc>) -> Result<i64, AppError>;

    async fn list_for_payer(
        &self,
        payer_id: Uuid,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<PaymentIntent>, AppError>;

    async fn events_for_booking(&self, booking_id: Uuid) -> Result<Vec<PaymentEventRecord>, AppError>;
}

pub fn event_record(envelope: &EventEnvelope, source: EventSource) -> Result<PaymentEventRecord, AppError> {
    Ok(PaymentEventRecord {
        event_id: envelope.event_id.clone(),
        event_type: envelope.event.type_name().to_string(),
        booking_id: envelope.event.natural_key().and_then(|key| Uuid::parse_str(&key).ok()),
        source: source.as_str().to_string(),
        payload: serde_json::to_value(envelope)?,
        processed_at: Utc::now(),
    })
}

#[derive(Default)]
struct Tables {
    intents: HashMap<Uuid, PaymentIntent>,
    events: Vec<PaymentEventRecord>,
}

impl Tables {
    fn has_event(&self, event_id: &str) -> bool {
        self.events.iter().any(|e| e.event_id == event_id)
    }
}

/// Store kept in process memory. One lock covers intents, the event log
/// and the outbox, standing in for a database transaction.
pub struct InMemoryPaymentStore {
    tables: Mutex<Tables>,
    outbox: Arc<InMemoryOutboxStore>,
}

impl InMemoryPaymentStore {
    pub fn new(outbox: Arc<InMemoryOutboxStore>) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            outbox,
        }
    }

    pub fn intent_count(&self) -> usize {
        self.lock().intents.len()
    }

    /// Moves an intent's creation time, for velocity window tests.
    pub fn backdate(&self, booking_id: Uuid, created_at: DateTime<Utc>) {
        if let Some(intent) = self.lock().intents.get_mut(&booking_id) {
            intent.created_at = created_at;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl PaymentStore for InMemoryPaymentStore {
    async fn create_if_absent(&self, new: NewPaymentIntent) -> Result<(PaymentIntent, bool), AppError> {
        let mut tables = self.lock();
        if let Some(existing) = tables.intents.get(&new.booking_id) {
            return Ok((existing.clone(), false));
        }
        let intent = new.into_intent();
        tables.intents.insert(intent.booking_id, intent.clone());
        Ok((intent, true))
    }

    async fn find_by_booking(&self, booking_id: Uuid) -> Result<Option<PaymentIntent>, AppError> {
        Ok(self.lock().intents.get(&booking_id).cloned())
    }

    async fn save(&self, intent: &PaymentIntent, events: &[EventEnvelope]) -> Result<PaymentIntent, AppError> {
        let mut tables = self.lock();
        let current_version = tables
            .intents
            .get(&intent.booking_id)
            .map(|stored| stored.version)
            .ok_or_else(|| AppError::rejected(ErrorCode::PaymentIntentNotFound, "Payment intent not found"))?;

        if current_version != intent.version {
            return Err(AppError::rejected(
                ErrorCode::ConcurrentModification,
                "Payment intent was modified concurrently",
            ));
        }

        let mut saved = intent.clone();
        saved.version += 1;
        saved.updated_at = Utc::now();

        let mut records = Vec::with_capacity(events.len());
        for envelope in events {
            records.push(event_record(envelope, EventSource::Internal)?);
        }

        tables.intents.insert(saved.booking_id, saved.clone());
        for (record, envelope) in records.into_iter().zip(events) {
            if !tables.has_event(&record.event_id) {
                tables.events.push(record);
                self.outbox.enqueue(envelope);
            }
        }
        Ok(saved)
    }

    async fn record_event(&self, envelope: &EventEnvelope, source: EventSource) -> Result<bool, AppError> {
        let record = event_record(envelope, source)?;
        let mut tables = self.lock();
        if tables.has_event(&record.event_id) {
            return Ok(false);
        }
        tables.events.push(record);
        self.outbox.enqueue(envelope);
        Ok(true)
    }

    async fn count_created_since(&self, subject: VelocitySubject, since: DateTime<Utc>) -> Result<i64, AppError> {
        let tables = self.lock();
        let count = tables
            .intents
            .values()
            .filter(|intent| intent.created_at >= since)
            .filter(|intent| match subject {
                VelocitySubject::Payer(payer) => intent.payer_id == Some(payer),
                VelocitySubject::Booking(booking) => intent.booking_id == booking,
            })
            .count();
        Ok(count as i64)
    }

    async fn list_for_payer(
        &self,
        payer_id: Uuid,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<PaymentIntent>, AppError> {
        let tables = self.lock();
        let mut intents: Vec<PaymentIntent> = tables
            .intents
            .values()
            .filter(|intent| intent.payer_id == Some(payer_id))
            .filter(|intent| intent.created_at >= from && intent.created_at < until)
            .cloned()
            .collect();
        intents.sort_by_key(|intent| intent.created_at);
        Ok(intents)
    }

    async fn events_for_booking(&self, booking_id: Uuid) -> Result<Vec<PaymentEventRecord>, AppError> {
        Ok(self
            .lock()
            .events
            .iter()
            .filter(|e| e.booking_id == Some(booking_id))
            .cloned()
            .collect())
    }
}
