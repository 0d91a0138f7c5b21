//! Compute device detection
//!
//! Queries nvidia-smi once at startup for visible accelerators and their total
//! memory. Without a usable GPU the loader runs against the CPU.

use serde::{Deserialize, Serialize};
use std::process::Command;
use std::sync::OnceLock;

/// Cached detection result
static GPU_INFO: OnceLock<GpuInfo> = OnceLock::new();

/// Where a model's weights live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeDevice {
    Cpu,
    Cuda(u32),
}

impl ComputeDevice {
    pub fn is_accelerator(&self) -> bool {
        matches!(self, ComputeDevice::Cuda(_))
    }
}

impl std::fmt::Display for ComputeDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda(index) => write!(f, "cuda:{}", index),
        }
    }
}

/// A single visible GPU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuDevice {
    pub index: u32,
    pub memory_total_bytes: u64,
}

/// Accelerators visible to this process
#[derive(Debug, Clone, Default)]
pub struct GpuInfo {
    pub devices: Vec<GpuDevice>,
}

impl GpuInfo {
    pub fn count(&self) -> usize {
        self.devices.len()
    }

    /// First visible GPU, or the CPU when none is available
    pub fn preferred_device(&self) -> ComputeDevice {
        self.devices
            .first()
            .map(|d| ComputeDevice::Cuda(d.index))
            .unwrap_or(ComputeDevice::Cpu)
    }

    /// Total memory of the given device, if it is a known GPU
    pub fn memory_of(&self, device: ComputeDevice) -> Option<u64> {
        match device {
            ComputeDevice::Cpu => None,
            ComputeDevice::Cuda(index) => self
                .devices
                .iter()
                .find(|d| d.index == index)
                .map(|d| d.memory_total_bytes),
        }
    }
}

/// Parse `index, memory.total [MiB]` CSV rows from nvidia-smi
fn parse_smi_output(stdout: &str) -> Vec<GpuDevice> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.split(',').map(str::trim);
            let index = fields.next()?.parse::<u32>().ok()?;
            let mib = fields.next()?.parse::<u64>().ok()?;
            Some(GpuDevice {
                index,
                memory_total_bytes: mib * 1024 * 1024,
            })
        })
        .collect()
}

/// Detect available GPUs using nvidia-smi
pub fn detect_gpus() -> GpuInfo {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=index,memory.total",
            "--format=csv,noheader,nounits",
        ])
        .output();

    match output {
        Ok(output) if output.status.success() => {
            let devices = parse_smi_output(&String::from_utf8_lossy(&output.stdout));

            tracing::info!(
                gpu_count = devices.len(),
                devices = ?devices,
                "Detected available GPUs"
            );

            GpuInfo { devices }
        }
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::warn!(stderr = %stderr, "nvidia-smi failed, using CPU");
            GpuInfo::default()
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to run nvidia-smi, using CPU");
            GpuInfo::default()
        }
    }
}

/// Get cached GPU info, detecting on first use
pub fn get_or_init() -> &'static GpuInfo {
    GPU_INFO.get_or_init(detect_gpus)
}
