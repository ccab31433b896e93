use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use karigo_common::AppError;

use crate::models::{HoldStatus, WalletHold};

#[async_trait]
pub trait HoldStore: Send + Sync {
    async fn create(&self, hold: &WalletHold) -> Result<WalletHold, AppError>;

    async fn find(&self, hold_id: Uuid) -> Result<Option<WalletHold>, AppError>;

    /// HELD → CAPTURED for a hold of `booking_id`. `None` when the hold is
    /// missing, not held or belongs to another booking; nothing is written then.
    async fn capture(&self, hold_id: Uuid, booking_id: Uuid) -> Result<Option<WalletHold>, AppError>;

    /// Releases every held hold of a booking and returns the ones changed.
    async fn release_for_booking(&self, booking_id: Uuid) -> Result<Vec<WalletHold>, AppError>;
}

#[derive(Default)]
pub struct InMemoryHoldStore {
    holds: Mutex<HashMap<Uuid, WalletHold>>,
    writes: AtomicUsize,
}

impl InMemoryHoldStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful state changes, creates included.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, WalletHold>> {
        self.holds.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl HoldStore for InMemoryHoldStore {
    async fn create(&self, hold: &WalletHold) -> Result<WalletHold, AppError> {
        let mut holds = self.lock();
        if holds.contains_key(&hold.id) {
            return Err(AppError::Conflict(format!("Hold {} already exists", hold.id)));
        }
        holds.insert(hold.id, hold.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(hold.clone())
    }

    async fn find(&self, hold_id: Uuid) -> Result<Option<WalletHold>, AppError> {
        Ok(self.lock().get(&hold_id).cloned())
    }

    async fn capture(&self, hold_id: Uuid, booking_id: Uuid) -> Result<Option<WalletHold>, AppError> {
        let mut holds = self.lock();
        match holds.get_mut(&hold_id) {
            Some(hold) if hold.booking_id == booking_id && hold.status == HoldStatus::Held => {
                let now = Utc::now();
                hold.status = HoldStatus::Captured;
                hold.captured_at = Some(now);
                hold.updated_at = now;
                self.writes.fetch_add(1, Ordering::SeqCst);
                Ok(Some(hold.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn release_for_booking(&self, booking_id: Uuid) -> Result<Vec<WalletHold>, AppError> {
        let mut holds = self.lock();
        let now = Utc::now();
        let mut released = Vec::new();
        for hold in holds
            .values_mut()
            .filter(|h| h.booking_id == booking_id && h.status == HoldStatus::Held)
        {
            hold.status = HoldStatus::Released;
            hold.released_at = Some(now);
            hold.updated_at = now;
            self.writes.fetch_add(1, Ordering::SeqCst);
            released.push(hold.clone());
        }
        Ok(released)
    }
}
