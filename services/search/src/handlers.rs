use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
};

use karigo_common::{ApiResponse, AppError, HealthStatus};

use crate::{
    models::{SearchDocument, SearchQuery},
    AppState,
};

pub async fn health_check() -> Json<ApiResponse<HealthStatus>> {
    Json(ApiResponse::success(HealthStatus::healthy("search-service")))
}

pub async fn search_rides(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<ApiResponse<Vec<SearchDocument>>>, AppError> {
    let hits = state.service.search(&query).await?;
    Ok(Json(ApiResponse::success(hits)))
}

pub async fn handler_404() -> (StatusCode, Json<ApiResponse<()>>) {
    (
        StatusCode::NOT_FOUND,
        Json(ApiResponse::error("Endpoint not found".to_string())),
    )
}
