//! Merge-and-swap pipeline
//!
//! One run moves through
//! `Resolving → CacheCheck → Loading → Merging → Persisting → Swapping →
//! Activating → Caching → Done`, short-circuiting to an error at any stage.
//! A cache hit jumps from `CacheCheck` straight to `Activating` without
//! touching the filesystem.
//!
//! All mutable state (cache, active slot, last merged artifact) lives behind a
//! single lock held for the whole run, so concurrent callers are serialized.

use crate::error::{MergeError, MergeResult};
use crate::host::{self, HostSignals, ModelHandle, ModelHost, Precision};
use crate::models::{
    ArtifactStore, CacheKey, CachedModel, CheckpointInfo, CheckpointRegistry, ModelCache,
    merge_state_dicts, tensor::state_dict_bytes,
};
use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

/// Pipeline stages, used to label progress and failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Resolving,
    CacheCheck,
    Loading,
    Merging,
    Persisting,
    Swapping,
    Activating,
    Caching,
    Done,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Resolving => write!(f, "resolving"),
            Self::CacheCheck => write!(f, "cache_check"),
            Self::Loading => write!(f, "loading"),
            Self::Merging => write!(f, "merging"),
            Self::Persisting => write!(f, "persisting"),
            Self::Swapping => write!(f, "swapping"),
            Self::Activating => write!(f, "activating"),
            Self::Caching => write!(f, "caching"),
            Self::Done => write!(f, "done"),
        }
    }
}

/// The model currently serving requests
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveModel {
    #[serde(skip)]
    pub handle: ModelHandle,
    pub key: CacheKey,
    pub checkpoint: CheckpointInfo,
}

/// Successful outcome of a combine run
#[derive(Debug, Clone, PartialEq)]
pub struct Activation {
    pub checkpoint: CheckpointInfo,
    /// Served from the model cache without reloading
    pub from_cache: bool,
}

impl Activation {
    pub fn message(&self) -> String {
        if self.from_cache {
            format!(
                "Model '{}' loaded from cache and ready for use.",
                self.checkpoint.name
            )
        } else {
            format!(
                "UNet and non-UNet parts combined and loaded successfully. \
                 The combined model '{}' is now the active checkpoint and ready for use.",
                self.checkpoint.name
            )
        }
    }
}

/// Outcome of cleaning up the last merged artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    Removed(PathBuf),
    NothingToClean,
}

impl CleanupOutcome {
    pub fn message(&self) -> String {
        match self {
            Self::Removed(_) => "Last combined model cleaned up successfully.".to_string(),
            Self::NothingToClean => "No combined model to clean up or file not found.".to_string(),
        }
    }
}

/// Process-scoped state mutated only by pipeline runs
struct PipelineState {
    cache: ModelCache,
    active: Option<ActiveModel>,
    last_merged: Option<PathBuf>,
}

/// Orchestrates combine-and-activate and cleanup against one host
pub struct MergePipeline {
    store: ArtifactStore,
    host: Arc<dyn ModelHost>,
    signals: Arc<HostSignals>,
    checkpoints: Arc<CheckpointRegistry>,
    precision: Precision,
    state: Mutex<PipelineState>,
}

impl MergePipeline {
    pub fn new(
        store: ArtifactStore,
        host: Arc<dyn ModelHost>,
        signals: Arc<HostSignals>,
        checkpoints: Arc<CheckpointRegistry>,
        cache_capacity: usize,
        precision: Precision,
    ) -> Self {
        Self {
            state: Mutex::new(PipelineState {
                cache: ModelCache::new(cache_capacity, host.clone()),
                active: None,
                last_merged: None,
            }),
            store,
            host,
            signals,
            checkpoints,
            precision,
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointRegistry> {
        &self.checkpoints
    }

    /// Artifact names for populating selection controls
    pub fn list_available_artifacts(&self) -> Vec<String> {
        self.store.list_artifacts()
    }

    /// Combine and activate, reporting the outcome as a status line
    pub async fn combine_and_activate(&self, unet_name: &str, non_unet_name: &str) -> String {
        match self.combine(unet_name, non_unet_name).await {
            Ok(activation) => activation.message(),
            Err(e) => e.status_line(),
        }
    }

    /// Clean up the last merged artifact, reporting the outcome as a status line
    pub async fn cleanup_last_artifact(&self) -> String {
        match self.cleanup().await {
            Ok(outcome) => outcome.message(),
            Err(e) => format!("Error cleaning up last combined model: {:#}", e),
        }
    }

    /// Snapshot of the active slot
    pub async fn active(&self) -> Option<ActiveModel> {
        self.state.lock().await.active.clone()
    }

    /// Path of the most recent merge output that has not been cleaned up
    pub async fn last_merged(&self) -> Option<PathBuf> {
        self.state.lock().await.last_merged.clone()
    }

    /// Cached combinations, most recently used first
    pub async fn cached_keys(&self) -> Vec<CacheKey> {
        self.state.lock().await.cache.keys()
    }

    /// Run the pipeline for one (unet, non-unet) pair
    pub async fn combine(&self, unet_name: &str, non_unet_name: &str) -> MergeResult<Activation> {
        let started = Instant::now();
        let mut state = self.state.lock().await;

        let result = self.run(&mut state, unet_name, non_unet_name).await;

        match &result {
            Ok(activation) => {
                tracing::info!(
                    stage = %Stage::Done,
                    title = %activation.checkpoint.title,
                    from_cache = activation.from_cache,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Combined model active"
                );
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    unet = %unet_name,
                    non_unet = %non_unet_name,
                    "Error loading UNet and non-UNet parts"
                );
                crate::metrics::record_combine_failure(match e {
                    MergeError::NotFound => "not_found",
                    MergeError::Io { .. } => "io",
                    MergeError::Activation { .. } => "activation",
                });
            }
        }

        result
    }

    async fn run(
        &self,
        state: &mut PipelineState,
        unet_name: &str,
        non_unet_name: &str,
    ) -> MergeResult<Activation> {
        tracing::info!(
            stage = %Stage::Resolving,
            unet = %unet_name,
            non_unet = %non_unet_name,
            "Resolving artifacts"
        );
        let key = self.resolve(unet_name, non_unet_name).await?;

        tracing::debug!(stage = %Stage::CacheCheck, unet = ?key.unet, non_unet = ?key.non_unet, "Checking model cache");
        if let Some(cached) = state.cache.peek(&key) {
            tracing::info!(title = %cached.checkpoint.title, "Loading model from cache");
            self.reactivate(state, key.clone(), cached.clone()).await?;
            state.cache.promote(&key);
            return Ok(Activation {
                checkpoint: cached.checkpoint,
                from_cache: true,
            });
        }

        tracing::info!(stage = %Stage::Loading, "Loading artifacts");
        let (non_unet, unet) = tokio::try_join!(
            async {
                self.store
                    .load(&key.non_unet)
                    .await
                    .map_err(|e| MergeError::io(&key.non_unet, &e))
            },
            async {
                self.store
                    .load(&key.unet)
                    .await
                    .map_err(|e| MergeError::io(&key.unet, &e))
            },
        )?;

        tracing::debug!(
            stage = %Stage::Merging,
            non_unet_tensors = non_unet.len(),
            unet_tensors = unet.len(),
            "Combining state dicts"
        );
        let merged = merge_state_dicts(non_unet, unet);

        tracing::debug!(
            stage = %Stage::Persisting,
            tensors = merged.len(),
            bytes = state_dict_bytes(&merged),
            "Saving merged artifact"
        );
        let combined_path = self.store.combined_path(unet_name, non_unet_name);
        let path = self
            .store
            .save(&merged, unet_name, non_unet_name)
            .await
            .map_err(|e| MergeError::io(&combined_path, &e))?;
        drop(merged);

        crate::metrics::record_merge(&self.store.combined_name(unet_name, non_unet_name));

        if let Some(previous) = state.last_merged.replace(path.clone())
            && previous != path
        {
            tracing::warn!(
                previous = ?previous,
                "Previous merged artifact left on storage; run cleanup to remove it"
            );
        }

        let checkpoint = self
            .register(&path)
            .await
            .map_err(|e| MergeError::activation(&e))?;

        let previous = self.vacate(state).await;

        tracing::info!(stage = %Stage::Activating, title = %checkpoint.title, "Loading combined model");
        let handle = match self.activate_new(&checkpoint).await {
            Ok(handle) => handle,
            Err(e) => {
                self.reinstate(state, previous).await;
                return Err(MergeError::activation(&e));
            }
        };

        state.active = Some(ActiveModel {
            handle: handle.clone(),
            key: key.clone(),
            checkpoint: checkpoint.clone(),
        });
        self.signal_reload();

        tracing::debug!(stage = %Stage::Caching, title = %checkpoint.title, "Caching model");
        state
            .cache
            .set(
                key,
                CachedModel {
                    handle,
                    checkpoint: checkpoint.clone(),
                },
            )
            .await;

        Ok(Activation {
            checkpoint,
            from_cache: false,
        })
    }

    /// Resolve both names and require both files to exist
    async fn resolve(&self, unet_name: &str, non_unet_name: &str) -> MergeResult<CacheKey> {
        if unet_name.is_empty() || non_unet_name.is_empty() {
            return Err(MergeError::NotFound);
        }

        let unet = self.store.resolve(unet_name);
        let non_unet = self.store.resolve(non_unet_name);

        if !is_file(&unet).await || !is_file(&non_unet).await {
            return Err(MergeError::NotFound);
        }

        Ok(CacheKey::new(unet, non_unet))
    }

    /// Hash the merged file and record it in the checkpoint registry
    async fn register(&self, path: &Path) -> Result<CheckpointInfo> {
        let checkpoint = CheckpointInfo::from_file(path)
            .await
            .context("Failed to register merged checkpoint")?;
        self.checkpoints.register(checkpoint.clone()).await;
        Ok(checkpoint)
    }

    /// Activate a cached model, swapping out whatever is active
    async fn reactivate(
        &self,
        state: &mut PipelineState,
        key: CacheKey,
        cached: CachedModel,
    ) -> MergeResult<()> {
        if state
            .active
            .as_ref()
            .is_some_and(|active| active.handle == cached.handle)
        {
            tracing::debug!(title = %cached.checkpoint.title, "Cached model already active");
            return Ok(());
        }

        let previous = self.vacate(state).await;

        tracing::info!(
            stage = %Stage::Activating,
            title = %cached.checkpoint.title,
            "Activating cached model"
        );
        if let Err(e) = self.install(&cached.handle).await {
            self.teardown(&cached.handle).await;
            self.reinstate(state, previous).await;
            return Err(MergeError::activation(&e));
        }

        state.active = Some(ActiveModel {
            handle: cached.handle,
            key,
            checkpoint: cached.checkpoint,
        });
        self.signal_reload();

        Ok(())
    }

    /// Empty the active slot, unhooking the old model and releasing its
    /// device memory. Failures are logged; the slot is vacated regardless.
    async fn vacate(&self, state: &mut PipelineState) -> Option<ActiveModel> {
        let previous = state.active.take()?;

        tracing::info!(
            stage = %Stage::Swapping,
            title = %previous.checkpoint.title,
            "Unloading current model and clearing device memory"
        );
        self.teardown(&previous.handle).await;

        Some(previous)
    }

    /// Load a merged checkpoint and make it servable. A model that fails
    /// part way is torn down and discarded.
    async fn activate_new(&self, checkpoint: &CheckpointInfo) -> Result<ModelHandle> {
        let handle = self
            .host
            .load_model(checkpoint)
            .await
            .context("Failed to load merged model")?;

        if let Err(e) = self.install(&handle).await {
            self.teardown(&handle).await;
            self.host.discard(&handle).await;
            return Err(e);
        }

        Ok(handle)
    }

    /// Place on the device, apply precision, then hook
    async fn install(&self, handle: &ModelHandle) -> Result<()> {
        let device = self.host.device();
        self.host
            .to_device(handle, device)
            .await
            .with_context(|| format!("Failed to move model to {}", device))?;
        self.host
            .set_precision(handle, self.precision)
            .await
            .context("Failed to apply precision")?;
        self.host
            .hook(handle)
            .await
            .context("Failed to install runtime hooks")?;
        Ok(())
    }

    /// Best-effort unhook and offload
    async fn teardown(&self, handle: &ModelHandle) {
        if let Err(e) = self.host.unhook(handle).await {
            tracing::warn!(error = %e, model_id = handle.id(), "Failed to undo runtime hooks");
        }
        if let Err(e) = host::offload(self.host.as_ref(), handle).await {
            tracing::warn!(error = %e, model_id = handle.id(), "Failed to release device memory");
        }
    }

    /// Put the pre-swap model back after a failed activation. If that also
    /// fails the slot stays empty.
    async fn reinstate(&self, state: &mut PipelineState, previous: Option<ActiveModel>) {
        let Some(previous) = previous else {
            return;
        };

        match self.install(&previous.handle).await {
            Ok(()) => {
                tracing::info!(title = %previous.checkpoint.title, "Previous model reinstated");
                state.active = Some(previous);
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    title = %previous.checkpoint.title,
                    "Failed to reinstate previous model, active slot left empty"
                );
                self.teardown(&previous.handle).await;
            }
        }
    }

    fn signal_reload(&self) {
        self.signals.interrupt();
        self.signals.request_model_reload();
    }

    /// Delete the last merged artifact if it is still on storage
    pub async fn cleanup(&self) -> Result<CleanupOutcome> {
        let mut state = self.state.lock().await;

        let Some(path) = state.last_merged.clone() else {
            crate::metrics::record_cleanup(false);
            return Ok(CleanupOutcome::NothingToClean);
        };

        if !self.store.delete(&path).await? {
            tracing::debug!(path = ?path, "Last merged artifact already gone");
            crate::metrics::record_cleanup(false);
            return Ok(CleanupOutcome::NothingToClean);
        }

        state.last_merged = None;
        tracing::info!(path = ?path, "Removed temporary combined model");
        crate::metrics::record_cleanup(true);

        Ok(CleanupOutcome::Removed(path))
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::ComputeDevice;
    use crate::host::mocks::{HostCall, MockHost};
    use crate::models::tensor::{self, StateDict, Tensor};
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        host: Arc<MockHost>,
        signals: Arc<HostSignals>,
        pipeline: MergePipeline,
    }

    fn fixture(capacity: usize) -> Fixture {
        let dir = TempDir::new().unwrap();
        let host = Arc::new(MockHost::new());
        let signals = Arc::new(HostSignals::new());
        let pipeline = MergePipeline::new(
            ArtifactStore::new(dir.path(), "safetensors"),
            host.clone(),
            signals.clone(),
            Arc::new(CheckpointRegistry::new()),
            capacity,
            Precision::Half,
        );
        Fixture {
            dir,
            host,
            signals,
            pipeline,
        }
    }

    fn dict(entries: &[(&str, f32)]) -> StateDict {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), Tensor::from_f32(vec![1], &[*v]).unwrap()))
            .collect()
    }

    fn write(dir: &TempDir, name: &str, entries: &[(&str, f32)]) {
        let bytes = tensor::encode(&dict(entries), None).unwrap();
        std::fs::write(dir.path().join(name), bytes).unwrap();
    }

    fn seed(f: &Fixture) {
        write(&f.dir, "unet.safetensors", &[("B", 3.0), ("C", 4.0)]);
        write(&f.dir, "te.safetensors", &[("A", 1.0), ("B", 2.0)]);
    }

    fn loads(call: &HostCall) -> bool {
        matches!(call, HostCall::Load(_))
    }

    #[tokio::test]
    async fn test_combine_merges_with_unet_precedence() {
        let f = fixture(3);
        seed(&f);

        let activation = f
            .pipeline
            .combine("unet.safetensors", "te.safetensors")
            .await
            .unwrap();

        assert!(!activation.from_cache);
        assert_eq!(activation.checkpoint.name, "Combined_unet_te");

        let path = f.dir.path().join("Combined_unet_te.safetensors");
        let merged = tensor::decode(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(merged, dict(&[("A", 1.0), ("B", 3.0), ("C", 4.0)]));

        assert_eq!(f.pipeline.last_merged().await, Some(path));
        assert!(f.signals.need_reload_model());

        let active = f.pipeline.active().await.unwrap();
        assert_eq!(active.checkpoint, activation.checkpoint);
        assert!(
            f.pipeline
                .checkpoints()
                .get(&activation.checkpoint.title)
                .await
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_activation_sequence_order() {
        let f = fixture(3);
        seed(&f);

        f.pipeline
            .combine("unet.safetensors", "te.safetensors")
            .await
            .unwrap();

        let calls = f.host.calls().await;
        let id = f.pipeline.active().await.unwrap().handle.id();
        assert!(matches!(calls[0], HostCall::Load(_)));
        assert_eq!(
            &calls[1..],
            &[
                HostCall::ToDevice(id, ComputeDevice::Cuda(0)),
                HostCall::Precision(id, Precision::Half),
                HostCall::Hook(id),
            ]
        );
    }

    #[tokio::test]
    async fn test_second_identical_combine_hits_cache() {
        let f = fixture(3);
        seed(&f);

        f.pipeline
            .combine("unet.safetensors", "te.safetensors")
            .await
            .unwrap();

        // A hit must not write the merged file again
        let path = f.dir.path().join("Combined_unet_te.safetensors");
        std::fs::remove_file(&path).unwrap();
        f.host.clear_calls().await;

        let activation = f
            .pipeline
            .combine("unet.safetensors", "te.safetensors")
            .await
            .unwrap();

        assert!(activation.from_cache);
        assert!(!path.exists());
        assert!(f.host.calls().await.is_empty());
        assert!(activation.message().contains("loaded from cache"));
    }

    #[tokio::test]
    async fn test_concurrent_combines_are_serialized() {
        let f = fixture(3);
        seed(&f);

        let (first, second) = futures::future::join(
            f.pipeline.combine("unet.safetensors", "te.safetensors"),
            f.pipeline.combine("unet.safetensors", "te.safetensors"),
        )
        .await;

        let (first, second) = (first.unwrap(), second.unwrap());
        assert_ne!(first.from_cache, second.from_cache);
        assert_eq!(first.checkpoint, second.checkpoint);
        assert_eq!(f.host.count(loads).await, 1);
        assert_eq!(f.pipeline.cached_keys().await.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found_and_changes_nothing() {
        let f = fixture(3);
        write(&f.dir, "unet.safetensors", &[("B", 3.0)]);

        let err = f
            .pipeline
            .combine("unet.safetensors", "missing.safetensors")
            .await
            .unwrap_err();

        assert_eq!(err, MergeError::NotFound);
        assert!(f.pipeline.active().await.is_none());
        assert!(f.pipeline.cached_keys().await.is_empty());
        assert!(f.host.calls().await.is_empty());
        assert!(!f.signals.need_reload_model());
    }

    #[tokio::test]
    async fn test_empty_name_is_not_found() {
        let f = fixture(3);
        seed(&f);
        let line = f.pipeline.combine_and_activate("", "te.safetensors").await;
        assert!(line.contains("do not exist"));
    }

    #[tokio::test]
    async fn test_corrupt_artifact_is_io_failure() {
        let f = fixture(3);
        write(&f.dir, "unet.safetensors", &[("B", 3.0)]);
        std::fs::write(f.dir.path().join("te.safetensors"), b"not tensors").unwrap();

        let err = f
            .pipeline
            .combine("unet.safetensors", "te.safetensors")
            .await
            .unwrap_err();

        assert!(matches!(err, MergeError::Io { ref path, .. } if path.ends_with("te.safetensors")));
        assert!(f.pipeline.last_merged().await.is_none());
        assert!(f.pipeline.cached_keys().await.is_empty());
        assert!(!f.dir.path().join("Combined_unet_te.safetensors").exists());
    }

    #[tokio::test]
    async fn test_swap_vacates_before_loading_new() {
        let f = fixture(3);
        seed(&f);
        write(&f.dir, "unet2.safetensors", &[("C", 5.0)]);

        f.pipeline
            .combine("unet.safetensors", "te.safetensors")
            .await
            .unwrap();
        let old = f.pipeline.active().await.unwrap().handle.id();
        f.host.clear_calls().await;

        f.pipeline
            .combine("unet2.safetensors", "te.safetensors")
            .await
            .unwrap();

        let calls = f.host.calls().await;
        assert_eq!(
            &calls[..3],
            &[
                HostCall::Unhook(old),
                HostCall::ToDevice(old, ComputeDevice::Cpu),
                HostCall::Release,
            ]
        );
        assert!(matches!(calls[3], HostCall::Load(_)));
        assert_eq!(f.pipeline.cached_keys().await.len(), 2);
    }

    #[tokio::test]
    async fn test_cache_hit_swaps_back_to_cached_model() {
        let f = fixture(3);
        seed(&f);
        write(&f.dir, "unet2.safetensors", &[("C", 5.0)]);

        f.pipeline
            .combine("unet.safetensors", "te.safetensors")
            .await
            .unwrap();
        let first = f.pipeline.active().await.unwrap().handle.id();
        f.pipeline
            .combine("unet2.safetensors", "te.safetensors")
            .await
            .unwrap();
        let second = f.pipeline.active().await.unwrap().handle.id();
        f.host.clear_calls().await;

        let activation = f
            .pipeline
            .combine("unet.safetensors", "te.safetensors")
            .await
            .unwrap();

        assert!(activation.from_cache);
        assert_eq!(f.pipeline.active().await.unwrap().handle.id(), first);
        assert_eq!(f.host.count(loads).await, 0);
        assert_eq!(
            f.host.calls().await,
            vec![
                HostCall::Unhook(second),
                HostCall::ToDevice(second, ComputeDevice::Cpu),
                HostCall::Release,
                HostCall::ToDevice(first, ComputeDevice::Cuda(0)),
                HostCall::Precision(first, Precision::Half),
                HostCall::Hook(first),
            ]
        );
        assert_eq!(
            f.pipeline.cached_keys().await[0].unet,
            f.dir.path().join("unet.safetensors")
        );
    }

    #[tokio::test]
    async fn test_cache_hit_activation_failure_leaves_cache_and_slot_unchanged() {
        let f = fixture(3);
        seed(&f);
        write(&f.dir, "unet2.safetensors", &[("C", 5.0)]);

        f.pipeline
            .combine("unet.safetensors", "te.safetensors")
            .await
            .unwrap();
        f.pipeline
            .combine("unet2.safetensors", "te.safetensors")
            .await
            .unwrap();
        let keys_before = f.pipeline.cached_keys().await;
        let active_before = f.pipeline.active().await;

        f.host.fail_next_to_device("out of device memory").await;
        let err = f
            .pipeline
            .combine("unet.safetensors", "te.safetensors")
            .await
            .unwrap_err();

        assert!(matches!(err, MergeError::Activation { .. }));
        assert_eq!(f.pipeline.cached_keys().await, keys_before);
        assert_eq!(f.pipeline.active().await, active_before);
        assert_eq!(f.host.count(loads).await, 2);
    }

    #[tokio::test]
    async fn test_capacity_one_evicts_previous_model() {
        let f = fixture(1);
        seed(&f);
        write(&f.dir, "unet2.safetensors", &[("C", 5.0)]);

        f.pipeline
            .combine("unet.safetensors", "te.safetensors")
            .await
            .unwrap();
        let old = f.pipeline.active().await.unwrap().handle.id();

        f.pipeline
            .combine("unet2.safetensors", "te.safetensors")
            .await
            .unwrap();

        assert_eq!(f.host.count(|c| *c == HostCall::Discard(old)).await, 1);
        assert_eq!(f.pipeline.cached_keys().await.len(), 1);
    }

    #[tokio::test]
    async fn test_activation_failure_reinstates_previous() {
        let f = fixture(3);
        seed(&f);
        write(&f.dir, "unet2.safetensors", &[("C", 5.0)]);

        f.pipeline
            .combine("unet.safetensors", "te.safetensors")
            .await
            .unwrap();
        let before = f.pipeline.active().await.unwrap();
        let keys_before = f.pipeline.cached_keys().await;

        f.host.fail_next_hook("hook rejected").await;
        let err = f
            .pipeline
            .combine("unet2.safetensors", "te.safetensors")
            .await
            .unwrap_err();

        assert!(
            matches!(err, MergeError::Activation { ref message } if message.contains("hook rejected"))
        );
        assert!(f.dir.path().join("Combined_unet2_te.safetensors").exists());
        assert_eq!(f.pipeline.cached_keys().await, keys_before);
        assert_eq!(f.pipeline.active().await, Some(before));
        assert_eq!(
            f.host.count(|c| matches!(c, HostCall::Discard(_))).await,
            1
        );
    }

    #[tokio::test]
    async fn test_failed_reinstate_leaves_slot_empty() {
        let f = fixture(3);
        seed(&f);
        write(&f.dir, "unet2.safetensors", &[("C", 5.0)]);

        f.pipeline
            .combine("unet.safetensors", "te.safetensors")
            .await
            .unwrap();
        let before = f.pipeline.active().await.unwrap();

        // New model and the reinstated old model both fail placement
        f.host.fail_next_to_device("out of device memory").await;
        f.host.fail_next_to_device("out of device memory").await;
        let line = f
            .pipeline
            .combine_and_activate("unet2.safetensors", "te.safetensors")
            .await;

        assert!(line.starts_with("Error loading UNet and non-UNet parts"));
        assert!(line.contains("out of device memory"));
        assert!(f.pipeline.active().await.is_none());

        let activation = f
            .pipeline
            .combine("unet.safetensors", "te.safetensors")
            .await
            .unwrap();
        assert!(activation.from_cache);
        assert_eq!(f.pipeline.active().await.unwrap().handle, before.handle);
    }

    #[tokio::test]
    async fn test_activation_failure_without_previous_leaves_slot_empty() {
        let f = fixture(3);
        seed(&f);
        f.host.fail_next_to_device("no device").await;

        let err = f
            .pipeline
            .combine("unet.safetensors", "te.safetensors")
            .await
            .unwrap_err();

        assert!(matches!(err, MergeError::Activation { .. }));
        assert!(f.pipeline.active().await.is_none());
        assert!(f.pipeline.cached_keys().await.is_empty());
        assert_eq!(
            f.host.count(|c| matches!(c, HostCall::Discard(_))).await,
            1
        );
    }

    #[tokio::test]
    async fn test_cleanup_lifecycle() {
        let f = fixture(3);
        seed(&f);

        assert_eq!(f.pipeline.cleanup().await.unwrap(), CleanupOutcome::NothingToClean);

        f.pipeline
            .combine("unet.safetensors", "te.safetensors")
            .await
            .unwrap();
        let path = f.dir.path().join("Combined_unet_te.safetensors");

        assert_eq!(
            f.pipeline.cleanup().await.unwrap(),
            CleanupOutcome::Removed(path.clone())
        );
        assert!(!path.exists());
        assert!(f.pipeline.last_merged().await.is_none());
        assert!(f.dir.path().join("unet.safetensors").exists());

        assert_eq!(
            f.pipeline.cleanup_last_artifact().await,
            "No combined model to clean up or file not found."
        );
    }

    #[tokio::test]
    async fn test_cleanup_file_already_gone_is_noop() {
        let f = fixture(3);
        seed(&f);

        f.pipeline
            .combine("unet.safetensors", "te.safetensors")
            .await
            .unwrap();
        std::fs::remove_file(f.dir.path().join("Combined_unet_te.safetensors")).unwrap();

        assert_eq!(f.pipeline.cleanup().await.unwrap(), CleanupOutcome::NothingToClean);
    }

    #[tokio::test]
    async fn test_new_merge_replaces_pointer_without_deleting() {
        let f = fixture(3);
        seed(&f);
        write(&f.dir, "unet2.safetensors", &[("C", 5.0)]);

        f.pipeline
            .combine("unet.safetensors", "te.safetensors")
            .await
            .unwrap();
        f.pipeline
            .combine("unet2.safetensors", "te.safetensors")
            .await
            .unwrap();

        assert!(f.dir.path().join("Combined_unet_te.safetensors").exists());
        assert_eq!(
            f.pipeline.last_merged().await,
            Some(f.dir.path().join("Combined_unet2_te.safetensors"))
        );
    }

    #[tokio::test]
    async fn test_list_available_artifacts() {
        let f = fixture(3);
        seed(&f);
        std::fs::write(f.dir.path().join("readme.md"), b"").unwrap();

        let mut names = f.pipeline.list_available_artifacts();
        names.sort();
        assert_eq!(names, vec!["te.safetensors", "unet.safetensors"]);
    }

    #[test]
    fn test_messages() {
        let checkpoint = CheckpointInfo::from_bytes(Path::new("/m/Combined_u_n.safetensors"), b"x");
        let fresh = Activation {
            checkpoint: checkpoint.clone(),
            from_cache: false,
        };
        assert!(fresh.message().contains("'Combined_u_n' is now the active checkpoint"));
        assert_eq!(
            CleanupOutcome::Removed(PathBuf::from("/m/x")).message(),
            "Last combined model cleaned up successfully."
        );
        assert_eq!(Stage::CacheCheck.to_string(), "cache_check");
    }
}
