//! Bounded cache of merged, loaded models
//!
//! Keyed by the (unet path, non-unet path) pair that produced the model.
//! Every hit or overwrite promotes the entry; inserting a new key at capacity
//! first evicts the least recently used entry and releases its device memory.

use super::checkpoint::CheckpointInfo;
use crate::host::{self, ModelHandle, ModelHost};
use lru::LruCache;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Default number of cached models
pub const DEFAULT_CAPACITY: usize = 3;

/// Ordered (unet, non-unet) pair identifying a combination
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CacheKey {
    pub unet: PathBuf,
    pub non_unet: PathBuf,
}

impl CacheKey {
    pub fn new(unet: impl Into<PathBuf>, non_unet: impl Into<PathBuf>) -> Self {
        Self {
            unet: unet.into(),
            non_unet: non_unet.into(),
        }
    }

    pub fn unet(&self) -> &Path {
        &self.unet
    }

    pub fn non_unet(&self) -> &Path {
        &self.non_unet
    }
}

/// A live merged model and the checkpoint it was built from
#[derive(Debug, Clone, PartialEq)]
pub struct CachedModel {
    pub handle: ModelHandle,
    pub checkpoint: CheckpointInfo,
}

/// LRU cache of live models
pub struct ModelCache {
    entries: LruCache<CacheKey, CachedModel>,
    host: Arc<dyn ModelHost>,
}

impl ModelCache {
    /// Create a cache holding at most `capacity` models (minimum one)
    pub fn new(capacity: usize, host: Arc<dyn ModelHost>) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            host,
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a model, promoting it to most recently used on a hit
    pub fn get(&mut self, key: &CacheKey) -> Option<CachedModel> {
        let hit = self.entries.get(key).cloned();
        record_lookup(hit.is_some());
        hit
    }

    /// Look up a model without changing recency
    pub fn peek(&self, key: &CacheKey) -> Option<CachedModel> {
        let hit = self.entries.peek(key).cloned();
        record_lookup(hit.is_some());
        hit
    }

    /// Mark an entry most recently used; absent keys are ignored
    pub fn promote(&mut self, key: &CacheKey) {
        self.entries.promote(key);
    }

    /// Presence check that leaves recency untouched
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains(key)
    }

    /// Insert or overwrite an entry as most recently used.
    ///
    /// A new key at capacity evicts the least recently used entry first. A
    /// replaced model with a different handle is released like an evicted one.
    /// A failed release is logged and the eviction still completes.
    pub async fn set(&mut self, key: CacheKey, model: CachedModel) {
        if self.entries.contains(&key) {
            let handle = model.handle.clone();
            if let Some(replaced) = self.entries.put(key.clone(), model)
                && replaced.handle != handle
            {
                tracing::info!(title = %replaced.checkpoint.title, "Replacing cached model");
                self.release(&key, &replaced).await;
            }
            return;
        }

        if self.entries.len() >= self.capacity()
            && let Some((evicted_key, evicted)) = self.entries.pop_lru()
        {
            tracing::info!(title = %evicted.checkpoint.title, "Evicting cached model");
            self.release(&evicted_key, &evicted).await;
            crate::metrics::record_cache_eviction();
        }

        self.entries.put(key, model);
        crate::metrics::update_cache_entries(self.entries.len());
    }

    /// Keys from most to least recently used
    pub fn keys(&self) -> Vec<CacheKey> {
        self.entries.iter().map(|(k, _)| k.clone()).collect()
    }

    /// Offload and discard a model leaving the cache
    async fn release(&self, key: &CacheKey, model: &CachedModel) {
        tracing::debug!(
            unet = ?key.unet,
            non_unet = ?key.non_unet,
            model_id = model.handle.id(),
            "Releasing cached model"
        );

        if let Err(e) = host::offload(self.host.as_ref(), &model.handle).await {
            tracing::warn!(
                error = %e,
                model_id = model.handle.id(),
                "Failed to release device memory of evicted model, continuing"
            );
        }
        self.host.discard(&model.handle).await;
    }
}

fn record_lookup(hit: bool) {
    if hit {
        crate::metrics::record_cache_hit();
    } else {
        crate::metrics::record_cache_miss();
    }
}
