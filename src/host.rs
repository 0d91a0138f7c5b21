//! Host runtime surface: model loading, device placement and hooks

use crate::gpu::ComputeDevice;
use crate::models::checkpoint::CheckpointInfo;
use crate::models::tensor::{self, StateDict};
use anyhow::{Context, Result};
use async_trait::async_trait;
use safetensors::tensor::Dtype;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::RwLock;

// ============================================================================
// Trait Definitions
// ============================================================================

/// Opaque reference to a live model owned by the host
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelHandle {
    pub(crate) id: u64,
}

impl ModelHandle {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Numeric precision applied before a model serves requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Full,
    Half,
}

/// Operations the pipeline needs from the runtime that owns the device.
///
/// Implementations must run device-affecting calls on whatever thread owns
/// the device context; the pipeline never issues two of them concurrently.
#[async_trait]
pub trait ModelHost: Send + Sync {
    /// Device the active model is served from
    fn device(&self) -> ComputeDevice;

    /// Build a live model from a registered checkpoint, resident in host memory
    async fn load_model(&self, checkpoint: &CheckpointInfo) -> Result<ModelHandle>;

    /// Move a model's weights to `device` (or back to host memory for `Cpu`)
    async fn to_device(&self, model: &ModelHandle, device: ComputeDevice) -> Result<()>;

    /// Apply precision and switch the model to inference mode
    async fn set_precision(&self, model: &ModelHandle, precision: Precision) -> Result<()>;

    /// Install runtime hooks on a model
    async fn hook(&self, model: &ModelHandle) -> Result<()>;

    /// Undo runtime hooks on a model
    async fn unhook(&self, model: &ModelHandle) -> Result<()>;

    /// Return freed device memory to the driver
    async fn release_device_memory(&self) -> Result<()>;

    /// Drop a model entirely; the handle is invalid afterwards
    async fn discard(&self, model: &ModelHandle);
}

/// Move a model to host memory and release the device memory it held
pub async fn offload(host: &dyn ModelHost, model: &ModelHandle) -> Result<()> {
    host.to_device(model, ComputeDevice::Cpu).await?;
    host.release_device_memory().await
}

/// Flags the host polls between requests
#[derive(Debug, Default)]
pub struct HostSignals {
    interrupt: AtomicBool,
    need_reload_model: AtomicBool,
}

impl HostSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask in-flight generation work to stop
    pub fn interrupt(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
    }

    /// Returns and clears the interrupt flag
    pub fn take_interrupt(&self) -> bool {
        self.interrupt.swap(false, Ordering::SeqCst)
    }

    pub fn request_model_reload(&self) {
        self.need_reload_model.store(true, Ordering::SeqCst);
    }

    pub fn need_reload_model(&self) -> bool {
        self.need_reload_model.load(Ordering::SeqCst)
    }

    /// Returns and clears the reload flag
    pub fn take_model_reload(&self) -> bool {
        self.need_reload_model.swap(false, Ordering::SeqCst)
    }
}

// ============================================================================
// Production Implementation
// ============================================================================

/// Counters of host operations
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HostStats {
    pub loads: u64,
    pub device_placements: u64,
    pub offloads: u64,
    pub hooks: u64,
    pub unhooks: u64,
    pub releases: u64,
    pub discards: u64,
}

struct LoadedModel {
    title: String,
    weights: StateDict,
    placement: ComputeDevice,
    precision: Precision,
    hooked: bool,
}

impl LoadedModel {
    /// Bytes the model occupies at its current precision
    fn footprint(&self) -> u64 {
        self.weights
            .values()
            .map(|t| match (self.precision, t.dtype()) {
                (Precision::Half, Dtype::F32 | Dtype::F64) => {
                    (t.shape().iter().product::<usize>() * 2) as u64
                }
                _ => t.nbytes() as u64,
            })
            .sum()
    }
}

/// In-process host that keeps weights in memory and accounts device residency
/// against a fixed device capacity
pub struct MemoryHost {
    device: ComputeDevice,
    /// None means unbounded
    device_capacity: Option<u64>,
    models: Arc<RwLock<HashMap<u64, LoadedModel>>>,
    next_id: AtomicU64,
    stats: Arc<RwLock<HostStats>>,
}

impl MemoryHost {
    pub fn new(device: ComputeDevice, device_capacity: Option<u64>) -> Self {
        Self {
            device,
            device_capacity,
            models: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            stats: Arc::new(RwLock::new(HostStats::default())),
        }
    }

    pub async fn stats(&self) -> HostStats {
        self.stats.read().await.clone()
    }

    /// Bytes currently placed on an accelerator
    pub async fn device_resident_bytes(&self) -> u64 {
        let models = self.models.read().await;
        models
            .values()
            .filter(|m| m.placement.is_accelerator())
            .map(|m| m.footprint())
            .sum()
    }

    pub async fn model_count(&self) -> usize {
        self.models.read().await.len()
    }

    pub async fn placement(&self, model: &ModelHandle) -> Option<ComputeDevice> {
        self.models.read().await.get(&model.id).map(|m| m.placement)
    }

    pub async fn is_hooked(&self, model: &ModelHandle) -> bool {
        self.models
            .read()
            .await
            .get(&model.id)
            .map(|m| m.hooked)
            .unwrap_or(false)
    }

    /// Checkpoint title and tensor count of a live model
    pub async fn describe(&self, model: &ModelHandle) -> Option<(String, usize)> {
        self.models
            .read()
            .await
            .get(&model.id)
            .map(|m| (m.title.clone(), m.weights.len()))
    }
}

#[async_trait]
impl ModelHost for MemoryHost {
    fn device(&self) -> ComputeDevice {
        self.device
    }

    async fn load_model(&self, checkpoint: &CheckpointInfo) -> Result<ModelHandle> {
        let path = checkpoint.path.clone();
        let weights = tokio::task::spawn_blocking(move || -> Result<StateDict> {
            let bytes = std::fs::read(&path)
                .with_context(|| format!("Failed to read checkpoint: {:?}", path))?;
            tensor::decode(&bytes)
        })
        .await
        .context("Model load task failed")??;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let model = LoadedModel {
            title: checkpoint.title.clone(),
            weights,
            placement: ComputeDevice::Cpu,
            precision: Precision::Full,
            hooked: false,
        };

        tracing::debug!(
            model_id = id,
            title = %checkpoint.title,
            tensors = model.weights.len(),
            "Model loaded into host memory"
        );

        self.models.write().await.insert(id, model);
        self.stats.write().await.loads += 1;

        Ok(ModelHandle { id })
    }

    async fn to_device(&self, model: &ModelHandle, device: ComputeDevice) -> Result<()> {
        let mut models = self.models.write().await;

        let resident_elsewhere: u64 = models
            .iter()
            .filter(|(id, m)| **id != model.id && m.placement.is_accelerator())
            .map(|(_, m)| m.footprint())
            .sum();

        let entry = models
            .get_mut(&model.id)
            .with_context(|| format!("Unknown model handle {}", model.id))?;

        if device.is_accelerator()
            && let Some(capacity) = self.device_capacity
        {
            let needed = entry.footprint();
            if resident_elsewhere + needed > capacity {
                anyhow::bail!(
                    "out of device memory on {}: need {} bytes, {} of {} in use",
                    device,
                    needed,
                    resident_elsewhere,
                    capacity
                );
            }
        }

        entry.placement = device;
        drop(models);

        let mut stats = self.stats.write().await;
        if device.is_accelerator() {
            stats.device_placements += 1;
        } else {
            stats.offloads += 1;
        }

        Ok(())
    }

    async fn set_precision(&self, model: &ModelHandle, precision: Precision) -> Result<()> {
        let mut models = self.models.write().await;
        let entry = models
            .get_mut(&model.id)
            .with_context(|| format!("Unknown model handle {}", model.id))?;
        entry.precision = precision;
        Ok(())
    }

    async fn hook(&self, model: &ModelHandle) -> Result<()> {
        let mut models = self.models.write().await;
        let entry = models
            .get_mut(&model.id)
            .with_context(|| format!("Unknown model handle {}", model.id))?;
        entry.hooked = true;
        drop(models);

        self.stats.write().await.hooks += 1;
        Ok(())
    }

    async fn unhook(&self, model: &ModelHandle) -> Result<()> {
        let mut models = self.models.write().await;
        let entry = models
            .get_mut(&model.id)
            .with_context(|| format!("Unknown model handle {}", model.id))?;
        entry.hooked = false;
        drop(models);

        self.stats.write().await.unhooks += 1;
        Ok(())
    }

    async fn release_device_memory(&self) -> Result<()> {
        self.stats.write().await.releases += 1;
        Ok(())
    }

    async fn discard(&self, model: &ModelHandle) {
        if self.models.write().await.remove(&model.id).is_some() {
            self.stats.write().await.discards += 1;
        }
    }
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================
