//! API request and response models

use crate::models::CacheKey;
use crate::pipeline::ActiveModel;
use serde::{Deserialize, Serialize};

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Request to combine two artifacts and activate the result
#[derive(Debug, Serialize, Deserialize)]
pub struct CombineRequest {
    /// Artifact supplying the denoiser weights
    pub unet: String,
    /// Artifact supplying every other component
    pub non_unet: String,
}

/// Human-readable outcome of a combine or cleanup
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub message: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl StatusResponse {
    pub fn new(message: String) -> Self {
        Self {
            message,
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Currently active combined model
#[derive(Debug, Serialize)]
pub struct ActiveResponse {
    pub title: String,
    pub sha256: String,
    pub shorthash: String,
    #[serde(flatten)]
    pub key: CacheKey,
}

impl From<ActiveModel> for ActiveResponse {
    fn from(active: ActiveModel) -> Self {
        Self {
            title: active.checkpoint.title,
            sha256: active.checkpoint.sha256,
            shorthash: active.checkpoint.shorthash,
            key: active.key,
        }
    }
}
