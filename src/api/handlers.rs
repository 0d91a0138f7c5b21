//! API request handlers

use super::models::{ActiveResponse, CombineRequest, HealthResponse, StatusResponse};
use super::routes::AppState;
use crate::error::ApiError;
use crate::models::CheckpointInfo;
use axum::{Json, extract::State, http::StatusCode};

/// GET /health - Loader health check
pub async fn health() -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
            timestamp: chrono::Utc::now(),
        }),
    )
}

/// GET /metrics - Prometheus metrics
pub async fn metrics(State(state): State<AppState>) -> String {
    state.prometheus_handle.render()
}

/// GET /artifacts - Artifact names available for combining
pub async fn list_artifacts(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.pipeline.list_available_artifacts())
}

/// POST /combine - Merge a UNet and a non-UNet artifact and activate the result
pub async fn combine(
    State(state): State<AppState>,
    Json(req): Json<CombineRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    for name in [&req.unet, &req.non_unet] {
        if name.contains('/') || name.contains('\\') {
            return Err(ApiError::BadRequest(format!(
                "Artifact name '{}' cannot contain path separators",
                name
            )));
        }
    }

    let activation = state.pipeline.combine(&req.unet, &req.non_unet).await?;

    Ok(Json(StatusResponse::new(activation.message())))
}

/// POST /cleanup - Delete the last merged artifact
pub async fn cleanup(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    let outcome = state.pipeline.cleanup().await.map_err(|e| {
        ApiError::Internal(format!("Error cleaning up last combined model: {:#}", e))
    })?;

    Ok(Json(StatusResponse::new(outcome.message())))
}

/// GET /active - Active combined model, or null
pub async fn active(State(state): State<AppState>) -> Json<Option<ActiveResponse>> {
    Json(state.pipeline.active().await.map(ActiveResponse::from))
}

/// GET /checkpoints - Registered checkpoints
pub async fn list_checkpoints(State(state): State<AppState>) -> Json<Vec<CheckpointInfo>> {
    Json(state.pipeline.checkpoints().list().await)
}
