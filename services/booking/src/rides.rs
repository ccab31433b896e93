use uuid::Uuid;

use karigo_common::{AppError, PeerClient};

use crate::models::{SeatLockCall, SeatLockReply, SeatUnlockCall, SeatUnlockReply};

/// Seat lock calls to the ride service.
#[derive(Clone)]
pub struct RideClient {
    peer: PeerClient,
}

impl RideClient {
    pub fn new(peer: PeerClient) -> Self {
        Self { peer }
    }

    pub async fn lock_seats(&self, ride_id: Uuid, booking_id: Uuid, seats: i32) -> Result<SeatLockReply, AppError> {
        self.peer
            .post_json(&format!("/rides/{ride_id}/lock"), &SeatLockCall { booking_id, seats })
            .await
    }

    pub async fn unlock_seats(&self, ride_id: Uuid, booking_id: Uuid) -> Result<SeatUnlockReply, AppError> {
        self.peer
            .post_json(&format!("/rides/{ride_id}/unlock"), &SeatUnlockCall { booking_id })
            .await
    }

    /// Returns a booking's seats, logging instead of failing.
    pub async fn release_best_effort(&self, ride_id: Uuid, booking_id: Uuid) {
        match self.unlock_seats(ride_id, booking_id).await {
            Ok(reply) => tracing::info!(
                ride_id = %ride_id,
                booking_id = %booking_id,
                released = reply.released_seats,
                "Seats released"
            ),
            Err(e) => tracing::warn!(
                ride_id = %ride_id,
                booking_id = %booking_id,
                error = %e,
                "Could not release seats"
            ),
        }
    }
}
