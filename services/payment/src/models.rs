use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use karigo_common::AppError;

/// Longest failure reason kept on an intent.
pub const MAX_FAILURE_REASON_LEN: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Confirmed,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Confirmed => "confirmed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }

    pub fn parse(s: &str) -> Result<Self, AppError> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "confirmed" => Ok(PaymentStatus::Confirmed),
            "failed" => Ok(PaymentStatus::Failed),
            "refunded" => Ok(PaymentStatus::Refunded),
            other => Err(AppError::Internal(format!("Unknown payment status '{other}'"))),
        }
    }

    /// Captured at some point, whether or not refunds followed.
    pub fn is_settled(&self) -> bool {
        matches!(self, PaymentStatus::Confirmed | PaymentStatus::Refunded)
    }
}

/// The authoritative payment record of one booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentIntent {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub payer_id: Option<Uuid>,
    pub amount: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub payment_method_type: Option<String>,
    pub payment_method_id: Option<String>,
    pub payment_provider: Option<String>,
    pub idempotency_key: Option<String>,
    pub failure_reason: Option<String>,
    pub refunded_amount: i64,
    pub captured_at: Option<DateTime<Utc>>,
    pub refunded_at: Option<DateTime<Utc>>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentIntent {
    pub fn refundable(&self) -> i64 {
        self.amount - self.refunded_amount
    }
}

/// Values used when an intent has to be created.
#[derive(Debug, Clone)]
pub struct NewPaymentIntent {
    pub booking_id: Uuid,
    pub payer_id: Option<Uuid>,
    pub amount: i64,
    pub currency: String,
    pub idempotency_key: Option<String>,
}

impl NewPaymentIntent {
    pub fn into_intent(self) -> PaymentIntent {
        let now = Utc::now();
        PaymentIntent {
            id: Uuid::new_v4(),
            booking_id: self.booking_id,
            payer_id: self.payer_id,
            amount: self.amount,
            currency: self.currency,
            status: PaymentStatus::Pending,
            payment_method_type: None,
            payment_method_id: None,
            payment_provider: None,
            idempotency_key: self.idempotency_key,
            failure_reason: None,
            refunded_amount: 0,
            captured_at: None,
            refunded_at: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CaptureRequest {
    pub booking_id: Uuid,
    #[validate(range(min = 1))]
    pub amount: i64,
    #[validate(length(equal = 3))]
    pub currency: Option<String>,
    pub payer_id: Option<Uuid>,
    #[validate(length(max = 64))]
    pub payment_method_type: Option<String>,
    #[validate(length(max = 128))]
    pub payment_method_id: Option<String>,
    #[validate(length(max = 64))]
    pub payment_provider: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RefundRequest {
    pub booking_id: Uuid,
    #[validate(range(min = 1))]
    pub amount: i64,
    pub payer_id: Option<Uuid>,
    #[validate(length(max = 500))]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct FailRequest {
    pub booking_id: Uuid,
    #[validate(length(min = 1))]
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct MockCaptureRequest {
    pub booking_id: Uuid,
    #[validate(range(min = 1))]
    pub amount: i64,
    pub currency: Option<String>,
    pub payer_id: Option<Uuid>,
    pub payment_method_type: Option<String>,
    pub payment_method_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct WebhookRequest {
    #[validate(length(min = 1, max = 255))]
    pub event_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Body returned by capture and refund, and cached by the idempotency ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentOperationResponse {
    pub intent_id: Uuid,
    pub booking_id: Uuid,
    pub status: PaymentStatus,
    pub amount: i64,
    pub refunded_amount: i64,
    pub currency: String,
    /// Amount moved by this call; 0 when nothing changed.
    pub processed_amount: i64,
    pub already_processed: bool,
}

impl PaymentOperationResponse {
    pub fn from_intent(intent: &PaymentIntent, processed_amount: i64, already_processed: bool) -> Self {
        Self {
            intent_id: intent.id,
            booking_id: intent.booking_id,
            status: intent.status,
            amount: intent.amount,
            refunded_amount: intent.refunded_amount,
            currency: intent.currency.clone(),
            processed_amount,
            already_processed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailResponse {
    pub booking_id: Uuid,
    pub intent_id: Option<Uuid>,
    pub status: Option<PaymentStatus>,
    pub reason: String,
    pub event_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookResponse {
    pub event_id: String,
    pub duplicate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MockCaptureResponse {
    pub event_id: String,
    pub published: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdempotencyStatus {
    Pending,
    Success,
    /// Replayed against an intent that was already captured.
    Cached,
}

impl IdempotencyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdempotencyStatus::Pending => "pending",
            IdempotencyStatus::Success => "success",
            IdempotencyStatus::Cached => "cached",
        }
    }

    pub fn parse(s: &str) -> Result<Self, AppError> {
        match s {
            "pending" => Ok(IdempotencyStatus::Pending),
            "success" => Ok(IdempotencyStatus::Success),
            "cached" => Ok(IdempotencyStatus::Cached),
            other => Err(AppError::Internal(format!("Unknown idempotency status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyRecord {
    pub key: String,
    pub operation: String,
    pub request_hash: String,
    pub status: IdempotencyStatus,
    pub response: Option<PaymentOperationResponse>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    Internal,
    Webhook,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Internal => "internal",
            EventSource::Webhook => "webhook",
        }
    }
}

/// Append-only audit entry of the payment event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentEventRecord {
    pub event_id: String,
    pub event_type: String,
    pub booking_id: Option<Uuid>,
    pub source: String,
    pub payload: serde_json::Value,
    pub processed_at: DateTime<Utc>,
}

/// Whose attempts the velocity guard counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VelocitySubject {
    Payer(Uuid),
    Booking(Uuid),
}

impl VelocitySubject {
    pub fn for_request(payer_id: Option<Uuid>, booking_id: Uuid) -> Self {
        match payer_id {
            Some(payer) => VelocitySubject::Payer(payer),
            None => VelocitySubject::Booking(booking_id),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceQuery {
    /// `YYYY-MM`; defaults to the current month.
    pub month: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceLine {
    pub booking_id: Uuid,
    pub amount: i64,
    pub refunded_amount: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub payment_method_type: Option<String>,
    pub payment_provider: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invoice {
    pub payer_id: Uuid,
    pub month: String,
    pub count: usize,
    pub captured_total: i64,
    pub refunded_total: i64,
    pub net_total: i64,
    pub currency: String,
    pub lines: Vec<InvoiceLine>,
}

/// Truncates on a character boundary.
pub fn truncate_reason(reason: &str) -> String {
    reason.chars().take(MAX_FAILURE_REASON_LEN).collect()
}
