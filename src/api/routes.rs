//! API route definitions

use crate::pipeline::MergePipeline;
use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::handlers;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<MergePipeline>,
    pub prometheus_handle: metrics_exporter_prometheus::PrometheusHandle,
}

/// Create the main API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health and status
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        // Artifacts and merging
        .route("/artifacts", get(handlers::list_artifacts))
        .route("/combine", post(handlers::combine))
        .route("/cleanup", post(handlers::cleanup))
        // Loaded models
        .route("/active", get(handlers::active))
        .route("/checkpoints", get(handlers::list_checkpoints))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}
