//! Host-resident tensors and flat key → tensor weight mappings
//!
//! Artifacts are safetensors files: an 8-byte header length, a JSON header
//! describing every tensor, then the raw little-endian buffers. Tensors are
//! kept as opaque byte buffers; nothing here interprets their values.

use anyhow::{Context, Result};
use safetensors::tensor::{Dtype, SafeTensors, View};
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};

/// A single CPU-resident tensor
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    dtype: Dtype,
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl Tensor {
    /// Build a tensor, checking the buffer length against dtype and shape
    pub fn new(dtype: Dtype, shape: Vec<usize>, data: Vec<u8>) -> Result<Self> {
        let expected = shape.iter().product::<usize>() * dtype.size();
        if data.len() != expected {
            anyhow::bail!(
                "tensor buffer is {} bytes, expected {} for {:?} {:?}",
                data.len(),
                expected,
                dtype,
                shape
            );
        }
        Ok(Self { dtype, shape, data })
    }

    /// F32 tensor from values, mostly for fixtures
    pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> Result<Self> {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(Dtype::F32, shape, data)
    }

    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn nbytes(&self) -> usize {
        self.data.len()
    }
}

impl View for &Tensor {
    fn dtype(&self) -> Dtype {
        self.dtype
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn data(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(&self.data)
    }

    fn data_len(&self) -> usize {
        self.data.len()
    }
}

/// Flat key → tensor mapping, ordered by key so writes are deterministic
pub type StateDict = BTreeMap<String, Tensor>;

/// Total bytes held by a mapping
pub fn state_dict_bytes(state_dict: &StateDict) -> u64 {
    state_dict.values().map(|t| t.nbytes() as u64).sum()
}

/// Combine the two weight subsets by key union.
///
/// The non-UNet mapping is applied first and the UNet mapping second, so a key
/// present in both resolves to the UNet tensor.
pub fn merge_state_dicts(non_unet: StateDict, unet: StateDict) -> StateDict {
    let mut merged = non_unet;
    let mut overlapping = 0usize;

    for (key, tensor) in unet {
        if merged.insert(key, tensor).is_some() {
            overlapping += 1;
        }
    }

    if overlapping > 0 {
        tracing::debug!(
            overlapping,
            "UNet tensors replaced non-UNet tensors with the same key"
        );
    }

    merged
}

/// Decode a safetensors buffer into an owned mapping
pub fn decode(bytes: &[u8]) -> Result<StateDict> {
    let tensors = SafeTensors::deserialize(bytes)
        .map_err(|e| anyhow::anyhow!("invalid safetensors data: {}", e))?;

    let mut state_dict = StateDict::new();
    for (name, view) in tensors.tensors() {
        let tensor = Tensor::new(view.dtype(), view.shape().to_vec(), view.data().to_vec())
            .with_context(|| format!("tensor '{}' is malformed", name))?;
        state_dict.insert(name, tensor);
    }

    Ok(state_dict)
}

/// Encode a mapping as safetensors with optional header metadata
pub fn encode(state_dict: &StateDict, metadata: Option<HashMap<String, String>>) -> Result<Vec<u8>> {
    safetensors::tensor::serialize(state_dict.iter(), &metadata)
        .map_err(|e| anyhow::anyhow!("failed to serialize tensors: {}", e))
}
