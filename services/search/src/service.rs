use std::sync::Arc;
use std::time::Duration;

use karigo_common::events::{EventEnvelope, RidePublished, RideUpdated};
use karigo_common::{AppError, DedupStore};

use crate::index::SearchIndex;
use crate::models::{SearchDocument, SearchQuery};

pub struct SearchService {
    index: Arc<dyn SearchIndex>,
    dedup: Arc<dyn DedupStore>,
    dedup_ttl: Duration,
}

impl SearchService {
    pub fn new(index: Arc<dyn SearchIndex>, dedup: Arc<dyn DedupStore>, dedup_ttl: Duration) -> Self {
        Self {
            index,
            dedup,
            dedup_ttl,
        }
    }

    pub async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchDocument>, AppError> {
        self.index.search(query).await
    }

    /// Indexes a ride the first time it is announced.
    pub async fn handle_published(&self, ride: &RidePublished) -> Result<(), AppError> {
        let key = format!("ride.published:{}", ride.ride_id);
        if !self.dedup.first_time(&key, self.dedup_ttl).await? {
            tracing::debug!(ride_id = %ride.ride_id, "Ride already indexed, skipping");
            return Ok(());
        }

        let result = self.index.upsert(&SearchDocument::from(ride)).await;
        self.release_on_failure(&key, result).await?;

        tracing::info!(ride_id = %ride.ride_id, "Ride indexed");
        Ok(())
    }

    pub async fn handle_updated(&self, envelope: &EventEnvelope, update: &RideUpdated) -> Result<(), AppError> {
        let key = format!("ride.updated:{}", envelope.event_id);
        if !self.dedup.first_time(&key, self.dedup_ttl).await? {
            tracing::debug!(event_id = %envelope.event_id, "Duplicate ride update, skipping");
            return Ok(());
        }

        let result = self
            .index
            .update_availability(update.ride_id, update.seats_available, &update.status)
            .await;
        let indexed = self.release_on_failure(&key, result).await?;

        if indexed {
            tracing::debug!(
                ride_id = %update.ride_id,
                seats_available = update.seats_available,
                "Ride availability updated"
            );
        } else {
            tracing::debug!(ride_id = %update.ride_id, "Update for a ride that is not indexed");
        }
        Ok(())
    }

    /// Drops the dedup marker when the write failed, so a redelivery can retry.
    async fn release_on_failure<T>(&self, key: &str, result: Result<T, AppError>) -> Result<T, AppError> {
        if let Err(e) = &result {
            tracing::warn!(dedup_key = key, error = %e, "Index write failed, releasing dedup marker");
            if let Err(forget_err) = self.dedup.forget(key).await {
                tracing::error!(dedup_key = key, error = %forget_err, "Could not release dedup marker");
            }
        }
        result
    }
}
