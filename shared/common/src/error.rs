use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Stable, client-facing error codes for rejected business operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    PaymentVelocityExceeded,
    IdempotencyKeyConflict,
    IdempotencyRequestInProgress,
    RefundAmountExceeded,
    PaymentIntentNotFound,
    PaymentNotCaptured,
    PaymentAlreadyRefunded,
    PaymentAmountMismatch,
    ConcurrentModification,
    InsufficientSeats,
    RideNotFound,
    RideNotBookable,
    BookingNotFound,
    HoldNotFound,
    InvalidSignature,
}

impl ErrorCode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::PaymentVelocityExceeded => "payment_velocity_exceeded",
            ErrorCode::IdempotencyKeyConflict => "idempotency_key_conflict",
            ErrorCode::IdempotencyRequestInProgress => "idempotency_request_in_progress",
            ErrorCode::RefundAmountExceeded => "refund_amount_exceeded",
            ErrorCode::PaymentIntentNotFound => "payment_intent_not_found",
            ErrorCode::PaymentNotCaptured => "payment_not_captured",
            ErrorCode::PaymentAlreadyRefunded => "payment_already_refunded",
            ErrorCode::PaymentAmountMismatch => "payment_amount_mismatch",
            ErrorCode::ConcurrentModification => "concurrent_modification",
            ErrorCode::InsufficientSeats => "insufficient_seats",
            ErrorCode::RideNotFound => "ride_not_found",
            ErrorCode::RideNotBookable => "ride_not_bookable",
            ErrorCode::BookingNotFound => "booking_not_found",
            ErrorCode::HoldNotFound => "hold_not_found",
            ErrorCode::InvalidSignature => "invalid_signature",
        }
    }

    pub fn parse(code: &str) -> Option<Self> {
        const ALL: [ErrorCode; 15] = [
            ErrorCode::PaymentVelocityExceeded,
            ErrorCode::IdempotencyKeyConflict,
            ErrorCode::IdempotencyRequestInProgress,
            ErrorCode::RefundAmountExceeded,
            ErrorCode::PaymentIntentNotFound,
            ErrorCode::PaymentNotCaptured,
            ErrorCode::PaymentAlreadyRefunded,
            ErrorCode::PaymentAmountMismatch,
            ErrorCode::ConcurrentModification,
            ErrorCode::InsufficientSeats,
            ErrorCode::RideNotFound,
            ErrorCode::RideNotBookable,
            ErrorCode::BookingNotFound,
            ErrorCode::HoldNotFound,
            ErrorCode::InvalidSignature,
        ];
        ALL.into_iter().find(|candidate| candidate.as_str() == code)
    }

    pub fn status_code(&self) -> u16 {
        match self {
            ErrorCode::PaymentIntentNotFound
            | ErrorCode::RideNotFound
            | ErrorCode::BookingNotFound
            | ErrorCode::HoldNotFound => 404,
            ErrorCode::PaymentVelocityExceeded => 429,
            ErrorCode::InvalidSignature => 401,
            _ => 409,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("{0}: {1}")]
    Rejected(ErrorCode, String),

    #[error("External service error: {0}")]
    ExternalService(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn rejected(code: ErrorCode, message: impl Into<String>) -> Self {
        AppError::Rejected(code, message.into())
    }

    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            AppError::Rejected(code, _) => Some(*code),
            _ => None,
        }
    }

    /// Errors that will fail the same way on every retry.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            AppError::Validation(_) | AppError::NotFound(_) | AppError::Unauthorized(_)
        )
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        AppError::Validation(errors.to_string())
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    pub error_code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
}

impl ApiError {
    pub fn new(error_code: String, message: String) -> Self {
        Self {
            error_code,
            message,
            details: None,
            timestamp: Utc::now(),
            request_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

// HTTP status code mapping
impl AppError {
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::Unauthorized(_) => 401,
            AppError::NotFound(_) => 404,
            AppError::Validation(_) => 400,
            AppError::Conflict(_) => 409,
            AppError::Rejected(code, _) => code.status_code(),
            AppError::ExternalService(_) => 502,
            _ => 500,
        }
    }

    pub fn error_code(&self) -> &str {
        match self {
            AppError::Database(_) => "database_error",
            AppError::Redis(_) => "cache_error",
            AppError::Serialization(_) => "serialization_error",
            AppError::Validation(_) => "validation_error",
            AppError::Unauthorized(_) => "unauthorized",
            AppError::NotFound(_) => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::Rejected(code, _) => code.as_str(),
            AppError::ExternalService(_) => "external_service_error",
            AppError::Internal(_) => "internal_error",
        }
    }

    fn public_message(&self) -> String {
        match self {
            AppError::Database(_) | AppError::Redis(_) | AppError::Internal(_) => {
                "Internal server error".to_string()
            }
            AppError::Rejected(_, message) => message.clone(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, "Request rejected");
        }

        let body = ApiError::new(self.error_code().to_string(), self.public_message());
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_errors_map_to_their_code_status() {
        let err = AppError::rejected(ErrorCode::RefundAmountExceeded, "nothing left to refund");
        assert_eq!(err.status_code(), 409);
        assert_eq!(err.error_code(), "refund_amount_exceeded");

        let err = AppError::rejected(ErrorCode::PaymentIntentNotFound, "missing");
        assert_eq!(err.status_code(), 404);

        let err = AppError::rejected(ErrorCode::PaymentVelocityExceeded, "slow down");
        assert_eq!(err.status_code(), 429);
    }

    #[test]
    fn error_codes_parse_back_from_their_wire_form() {
        for code in [
            ErrorCode::IdempotencyKeyConflict,
            ErrorCode::InsufficientSeats,
            ErrorCode::InvalidSignature,
        ] {
            assert_eq!(ErrorCode::parse(code.as_str()), Some(code));
        }
        assert_eq!(ErrorCode::parse("nope"), None);
    }

    #[test]
    fn validation_is_permanent_but_conflicts_are_not() {
        assert!(AppError::Validation("bad".into()).is_permanent());
        assert!(!AppError::Internal("boom".into()).is_permanent());
        assert!(!AppError::rejected(ErrorCode::ConcurrentModification, "race").is_permanent());
    }
}
