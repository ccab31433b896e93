use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;
use validator::Validate;

use karigo_common::events::{PaymentCaptured, PaymentFailed};
use karigo_common::{AppError, ErrorCode};

use crate::models::{CreateHoldRequest, HoldStatus, WalletHold};
use crate::store::HoldStore;

pub struct WalletService {
    store: Arc<dyn HoldStore>,
    default_currency: String,
}

impl WalletService {
    pub fn new(store: Arc<dyn HoldStore>, default_currency: impl Into<String>) -> Self {
        Self {
            store,
            default_currency: default_currency.into(),
        }
    }

    pub async fn create_hold(&self, request: CreateHoldRequest) -> Result<WalletHold, AppError> {
        request.validate()?;

        let now = Utc::now();
        let hold = WalletHold {
            id: Uuid::new_v4(),
            user_id: request.user_id,
            booking_id: request.booking_id,
            amount: request.amount,
            currency: request
                .currency
                .map(|c| c.to_uppercase())
                .unwrap_or_else(|| self.default_currency.clone()),
            status: HoldStatus::Held,
            captured_at: None,
            released_at: None,
            created_at: now,
            updated_at: now,
        };

        let hold = self.store.create(&hold).await?;
        tracing::info!(hold_id = %hold.id, booking_id = %hold.booking_id, amount = hold.amount, "Wallet hold placed");
        Ok(hold)
    }

    pub async fn get_hold(&self, hold_id: Uuid) -> Result<WalletHold, AppError> {
        self.store
            .find(hold_id)
            .await?
            .ok_or_else(|| AppError::rejected(ErrorCode::HoldNotFound, format!("Hold {hold_id} not found")))
    }

    /// Settles the hold named by the capture. Captures without a hold, for a
    /// hold that is no longer held, or for another booking's hold change nothing.
    pub async fn handle_captured(&self, event: &PaymentCaptured) -> Result<(), AppError> {
        let Some(hold_id) = event.hold_id else {
            tracing::debug!(booking_id = %event.booking_id, "Capture carries no wallet hold");
            return Ok(());
        };

        if let Some(hold) = self.store.capture(hold_id, event.booking_id).await? {
            tracing::info!(hold_id = %hold.id, booking_id = %hold.booking_id, "Wallet hold captured");
            return Ok(());
        }

        match self.store.find(hold_id).await? {
            Some(hold) if hold.booking_id != event.booking_id => tracing::warn!(
                hold_id = %hold_id,
                hold_booking_id = %hold.booking_id,
                booking_id = %event.booking_id,
                "Capture names a hold of another booking, ignoring"
            ),
            _ => tracing::debug!(hold_id = %hold_id, "Hold missing or already settled, ignoring capture"),
        }
        Ok(())
    }

    pub async fn handle_failed(&self, event: &PaymentFailed) -> Result<(), AppError> {
        let released = self.store.release_for_booking(event.booking_id).await?;
        for hold in &released {
            tracing::info!(hold_id = %hold.id, booking_id = %hold.booking_id, "Wallet hold released");
        }
        Ok(())
    }
}
