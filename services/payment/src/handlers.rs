use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use uuid::Uuid;

use karigo_auth::{verify, SIGNATURE_HEADER};
use karigo_common::{ApiResponse, AppError, ErrorCode, HealthStatus, JsonBody};

use crate::{
    invoices::to_csv,
    models::{
        CaptureRequest, FailRequest, FailResponse, Invoice, InvoiceQuery, MockCaptureRequest, MockCaptureResponse,
        PaymentEventRecord, PaymentIntent, PaymentOperationResponse, RefundRequest, WebhookRequest, WebhookResponse,
    },
    AppState,
};

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

fn idempotency_key(headers: &HeaderMap) -> Result<Option<String>, AppError> {
    let Some(value) = headers.get(IDEMPOTENCY_KEY_HEADER) else {
        return Ok(None);
    };
    let key = value
        .to_str()
        .map_err(|_| AppError::Validation("Idempotency-Key must be visible ASCII".to_string()))?
        .trim();

    if key.is_empty() {
        return Ok(None);
    }
    if key.len() > MAX_IDEMPOTENCY_KEY_LEN {
        return Err(AppError::Validation(format!(
            "Idempotency-Key must be at most {MAX_IDEMPOTENCY_KEY_LEN} characters"
        )));
    }
    Ok(Some(key.to_string()))
}

pub async fn health_check() -> Json<ApiResponse<HealthStatus>> {
    Json(ApiResponse::success(HealthStatus::healthy("payment-service")))
}

pub async fn mock_capture(
    State(state): State<AppState>,
    JsonBody(request): JsonBody<MockCaptureRequest>,
) -> Result<Json<ApiResponse<MockCaptureResponse>>, AppError> {
    let response = state.service.mock_capture(request).await?;
    Ok(Json(ApiResponse::success(response)))
}

pub async fn capture_payment(
    State(state): State<AppState>,
    headers: HeaderMap,
    JsonBody(request): JsonBody<CaptureRequest>,
) -> Result<Json<ApiResponse<PaymentOperationResponse>>, AppError> {
    let key = idempotency_key(&headers)?;
    let response = state.service.capture(key.as_deref(), request).await?;
    Ok(Json(ApiResponse::success(response)))
}

pub async fn refund_payment(
    State(state): State<AppState>,
    headers: HeaderMap,
    JsonBody(request): JsonBody<RefundRequest>,
) -> Result<Json<ApiResponse<PaymentOperationResponse>>, AppError> {
    let key = idempotency_key(&headers)?;
    let response = state.service.refund(key.as_deref(), request).await?;
    Ok(Json(ApiResponse::success(response)))
}

pub async fn fail_payment(
    State(state): State<AppState>,
    JsonBody(request): JsonBody<FailRequest>,
) -> Result<Json<ApiResponse<FailResponse>>, AppError> {
    let response = state.service.mark_failed(request).await?;
    Ok(Json(ApiResponse::success(response)))
}

pub async fn get_payment(
    State(state): State<AppState>,
    Path(booking_id): Path<Uuid>,
) -> Result<Json<ApiResponse<PaymentIntent>>, AppError> {
    let intent = state.service.get_intent(booking_id).await?;
    Ok(Json(ApiResponse::success(intent)))
}

pub async fn get_payment_events(
    State(state): State<AppState>,
    Path(booking_id): Path<Uuid>,
) -> Result<Json<ApiResponse<Vec<PaymentEventRecord>>>, AppError> {
    let events = state.service.events(booking_id).await?;
    Ok(Json(ApiResponse::success(events)))
}

/// Takes the raw body so the signature is checked over the exact bytes sent.
pub async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ApiResponse<WebhookResponse>>, AppError> {
    if let Some(secret) = state.service.config().webhook_secret.as_deref() {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if !verify(secret, &body, signature) {
            tracing::warn!("Rejected webhook with a bad signature");
            return Err(AppError::rejected(ErrorCode::InvalidSignature, "Webhook signature mismatch"));
        }
    }

    let request: WebhookRequest = serde_json::from_slice(&body)
        .map_err(|e| AppError::Validation(format!("Malformed webhook body: {e}")))?;
    let response = state.service.handle_webhook(request).await?;
    Ok(Json(ApiResponse::success(response)))
}

pub async fn get_invoice(
    State(state): State<AppState>,
    Path(payer_id): Path<Uuid>,
    Query(query): Query<InvoiceQuery>,
) -> Result<Json<ApiResponse<Invoice>>, AppError> {
    let invoice = state.service.invoice(payer_id, query.month.as_deref()).await?;
    Ok(Json(ApiResponse::success(invoice)))
}

pub async fn export_invoice_csv(
    State(state): State<AppState>,
    Path(payer_id): Path<Uuid>,
    Query(query): Query<InvoiceQuery>,
) -> Result<Response, AppError> {
    let invoice = state.service.invoice(payer_id, query.month.as_deref()).await?;
    let csv = to_csv(&invoice)?;
    let disposition = format!("attachment; filename=\"invoice-{}-{}.csv\"", payer_id, invoice.month);

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        csv,
    )
        .into_response())
}

pub async fn handler_404() -> (StatusCode, Json<ApiResponse<()>>) {
    (
        StatusCode::NOT_FOUND,
        Json(ApiResponse::error("Endpoint not found".to_string())),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn blank_idempotency_keys_are_ignored() {
        let mut headers = HeaderMap::new();
        assert_eq!(idempotency_key(&headers).unwrap(), None);

        headers.insert(IDEMPOTENCY_KEY_HEADER, HeaderValue::from_static("  "));
        assert_eq!(idempotency_key(&headers).unwrap(), None);

        headers.insert(IDEMPOTENCY_KEY_HEADER, HeaderValue::from_static(" order-42 "));
        assert_eq!(idempotency_key(&headers).unwrap().as_deref(), Some("order-42"));

        let long = "k".repeat(MAX_IDEMPOTENCY_KEY_LEN + 1);
        headers.insert(IDEMPOTENCY_KEY_HEADER, HeaderValue::from_str(&long).unwrap());
        assert!(idempotency_key(&headers).is_err());
    }
}
