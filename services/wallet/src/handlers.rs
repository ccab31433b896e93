use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use uuid::Uuid;

use karigo_common::{ApiResponse, AppError, HealthStatus, JsonBody};

use crate::{
    models::{CreateHoldRequest, WalletHold},
    AppState,
};

pub async fn health_check() -> Json<ApiResponse<HealthStatus>> {
    Json(ApiResponse::success(HealthStatus::healthy("wallet-service")))
}

pub async fn create_hold(
    State(state): State<AppState>,
    JsonBody(request): JsonBody<CreateHoldRequest>,
) -> Result<(StatusCode, Json<ApiResponse<WalletHold>>), AppError> {
    let hold = state.service.create_hold(request).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(hold))))
}

pub async fn get_hold(
    State(state): State<AppState>,
    Path(hold_id): Path<Uuid>,
) -> Result<Json<ApiResponse<WalletHold>>, AppError> {
    let hold = state.service.get_hold(hold_id).await?;
    Ok(Json(ApiResponse::success(hold)))
}

pub async fn handler_404() -> (StatusCode, Json<ApiResponse<()>>) {
    (
        StatusCode::NOT_FOUND,
        Json(ApiResponse::error("Endpoint not found".to_string())),
    )
}
