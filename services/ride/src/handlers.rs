use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use uuid::Uuid;

use karigo_common::{ApiResponse, AppError, HealthStatus, JsonBody};

use crate::{
    models::{CreateRideRequest, LockResponse, LockSeatsRequest, Ride, UnlockResponse, UnlockSeatsRequest},
    AppState,
};

pub async fn health_check() -> Json<ApiResponse<HealthStatus>> {
    Json(ApiResponse::success(HealthStatus::healthy("ride-service")))
}

pub async fn create_ride(
    State(state): State<AppState>,
    JsonBody(request): JsonBody<CreateRideRequest>,
) -> Result<(StatusCode, Json<ApiResponse<Ride>>), AppError> {
    let ride = state.service.create_ride(request).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(ride))))
}

pub async fn get_ride(
    State(state): State<AppState>,
    Path(ride_id): Path<Uuid>,
) -> Result<Json<ApiResponse<Ride>>, AppError> {
    let ride = state.service.get_ride(ride_id).await?;
    Ok(Json(ApiResponse::success(ride)))
}

pub async fn publish_ride(
    State(state): State<AppState>,
    Path(ride_id): Path<Uuid>,
) -> Result<Json<ApiResponse<Ride>>, AppError> {
    let ride = state.service.publish_ride(ride_id).await?;
    Ok(Json(ApiResponse::success(ride)))
}

pub async fn lock_seats(
    State(state): State<AppState>,
    Path(ride_id): Path<Uuid>,
    JsonBody(request): JsonBody<LockSeatsRequest>,
) -> Result<Json<ApiResponse<LockResponse>>, AppError> {
    let response = state.service.lock_seats(ride_id, request).await?;
    Ok(Json(ApiResponse::success(response)))
}

pub async fn unlock_seats(
    State(state): State<AppState>,
    Path(ride_id): Path<Uuid>,
    JsonBody(request): JsonBody<UnlockSeatsRequest>,
) -> Result<Json<ApiResponse<UnlockResponse>>, AppError> {
    let response = state.service.unlock_seats(ride_id, request).await?;
    Ok(Json(ApiResponse::success(response)))
}

pub async fn handler_404() -> (StatusCode, Json<ApiResponse<()>>) {
    (
        StatusCode::NOT_FOUND,
        Json(ApiResponse::error("Endpoint not found".to_string())),
    )
}
