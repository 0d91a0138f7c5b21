//! Artifact storage in the fixed models directory
//!
//! Layout:
//! ```text
//! models/
//! ├── sdxl_unet.safetensors
//! ├── sdxl_clip_vae.safetensors
//! └── Combined_sdxl_unet_sdxl_clip_vae.safetensors   (written by a merge)
//! ```

use super::tensor::{self, StateDict};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Prefix of every merge-produced artifact name
pub const COMBINED_PREFIX: &str = "Combined_";

/// Resolves, lists, loads and writes artifacts inside one directory
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
    suffix: String,
}

impl ArtifactStore {
    /// Create a store over `dir` for files ending in `.<suffix>`
    pub fn new(dir: impl Into<PathBuf>, suffix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            suffix: suffix.into().trim_start_matches('.').to_string(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// Names of every entry whose name ends with the artifact suffix.
    ///
    /// Order is whatever the filesystem yields. A missing or unreadable
    /// directory lists as empty.
    pub fn list_artifacts(&self) -> Vec<String> {
        let dotted = format!(".{}", self.suffix);

        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(dir = ?self.dir, error = %e, "Cannot read models directory");
                return Vec::new();
            }
        };

        entries
            .flatten()
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .filter(|name| name.ends_with(&dotted))
            .collect()
    }

    /// Join the models directory with `name`; existence is not checked
    pub fn resolve(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Deterministic name of the artifact produced by merging the two sources
    pub fn combined_name(&self, unet_name: &str, non_unet_name: &str) -> String {
        format!("{}{}_{}", COMBINED_PREFIX, stem(unet_name), stem(non_unet_name))
    }

    /// Path the merged artifact for this pair is written to
    pub fn combined_path(&self, unet_name: &str, non_unet_name: &str) -> PathBuf {
        self.dir.join(format!(
            "{}.{}",
            self.combined_name(unet_name, non_unet_name),
            self.suffix
        ))
    }

    /// Read and decode an artifact on a blocking worker
    pub async fn load(&self, path: &Path) -> Result<StateDict> {
        let owned = path.to_path_buf();

        let state_dict = tokio::task::spawn_blocking(move || -> Result<StateDict> {
            let bytes = std::fs::read(&owned)
                .with_context(|| format!("Failed to read artifact: {:?}", owned))?;
            tensor::decode(&bytes).with_context(|| format!("Failed to decode artifact: {:?}", owned))
        })
        .await
        .context("Artifact load task failed")??;

        tracing::debug!(path = ?path, tensors = state_dict.len(), "Artifact loaded");

        Ok(state_dict)
    }

    /// Write a merged mapping under `Combined_<unet-stem>_<non-unet-stem>`,
    /// replacing any file of that name. Returns the written path.
    pub async fn save(
        &self,
        merged: &StateDict,
        unet_name: &str,
        non_unet_name: &str,
    ) -> Result<PathBuf> {
        let path = self.combined_path(unet_name, non_unet_name);

        let metadata = HashMap::from([
            ("unet_source".to_string(), unet_name.to_string()),
            ("non_unet_source".to_string(), non_unet_name.to_string()),
        ]);
        let bytes = tensor::encode(merged, Some(metadata))?;

        // Atomic write: temp file, then rename over the destination
        let temp_file = path.with_extension("tmp");

        if let Err(e) = write_and_rename(&temp_file, &path, &bytes).await {
            if let Err(remove_err) = fs::remove_file(&temp_file).await
                && remove_err.kind() != std::io::ErrorKind::NotFound
            {
                tracing::warn!(
                    path = ?temp_file,
                    error = %remove_err,
                    "Failed to remove temp artifact"
                );
            }
            return Err(e);
        }

        tracing::info!(path = ?path, bytes = bytes.len(), "Merged artifact saved");

        Ok(path)
    }

    /// Remove a file; returns whether anything was removed
    pub async fn delete(&self, path: &Path) -> Result<bool> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to remove artifact: {:?}", path)),
        }
    }
}

async fn write_and_rename(temp_file: &Path, path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = fs::File::create(temp_file)
        .await
        .with_context(|| format!("Failed to create temp artifact: {:?}", temp_file))?;
    file.write_all(bytes)
        .await
        .context("Failed to write merged artifact")?;
    file.sync_all()
        .await
        .context("Failed to sync merged artifact")?;
    drop(file);

    fs::rename(temp_file, path)
        .await
        .with_context(|| format!("Failed to move merged artifact into place: {:?}", path))
}

/// File name without its final extension
fn stem(name: &str) -> &str {
    Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(name)
}
