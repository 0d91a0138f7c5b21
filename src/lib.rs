//! UNet Loader - merge split diffusion checkpoints and hot-swap the result
//!
//! Combines a UNet artifact with a non-UNet artifact into one safetensors
//! checkpoint, activates it on the host's device, and keeps a small LRU cache
//! of merged models so repeated combinations swap in without a reload.

pub mod api;
pub mod config;
pub mod error;
pub mod gpu;
pub mod host;
pub mod metrics;
pub mod models;
pub mod pipeline;

pub use config::LoaderConfig;
pub use error::{ApiError, MergeError, MergeResult};
pub use gpu::ComputeDevice;
pub use host::{HostSignals, MemoryHost, ModelHandle, ModelHost, Precision};
pub use models::{
    ArtifactStore, CacheKey, CachedModel, CheckpointInfo, CheckpointRegistry, ModelCache,
    StateDict, Tensor, merge_state_dicts,
};
pub use pipeline::{Activation, ActiveModel, CleanupOutcome, MergePipeline};
