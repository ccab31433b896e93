use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use uuid::Uuid;

use karigo_common::{ApiResponse, AppError, HealthStatus, JsonBody};

use crate::{
    models::{Booking, CreateBookingRequest},
    AppState,
};

pub async fn health_check() -> Json<ApiResponse<HealthStatus>> {
    Json(ApiResponse::success(HealthStatus::healthy("booking-service")))
}

pub async fn create_booking(
    State(state): State<AppState>,
    JsonBody(request): JsonBody<CreateBookingRequest>,
) -> Result<(StatusCode, Json<ApiResponse<Booking>>), AppError> {
    let booking = state.service.create_booking(request).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(booking))))
}

pub async fn get_booking(
    State(state): State<AppState>,
    Path(booking_id): Path<Uuid>,
) -> Result<Json<ApiResponse<Booking>>, AppError> {
    let booking = state.service.get_booking(booking_id).await?;
    Ok(Json(ApiResponse::success(booking)))
}

pub async fn handler_404() -> (StatusCode, Json<ApiResponse<()>>) {
    (
        StatusCode::NOT_FOUND,
        Json(ApiResponse::error("Endpoint not found".to_string())),
    )
}
