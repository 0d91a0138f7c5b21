//! Weight artifacts and the models built from them
//!
//! Provides functionality for:
//! - Decoding, merging and encoding flat key → tensor mappings
//! - Listing, resolving, writing and deleting artifacts in the models directory
//! - Checkpoint identity records and their registry
//! - The bounded LRU cache of loaded models

pub mod cache;
pub mod checkpoint;
pub mod store;
pub mod tensor;

pub use cache::{CacheKey, CachedModel, DEFAULT_CAPACITY, ModelCache};
pub use checkpoint::{CheckpointInfo, CheckpointRegistry};
pub use store::{ArtifactStore, COMBINED_PREFIX};
pub use tensor::{StateDict, Tensor, merge_state_dicts};
