//! Checkpoint registration records and the global checkpoint registry

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Length of the short hash shown in checkpoint titles
const SHORTHASH_LEN: usize = 10;

/// Identity record for a model artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointInfo {
    /// File stem, e.g. "Combined_unet_clip"
    pub name: String,
    pub path: PathBuf,
    /// "<name> [<shorthash>]"
    pub title: String,
    /// Full SHA-256 of the file contents, lowercase hex
    pub sha256: String,
    pub shorthash: String,
    pub registered_at: DateTime<Utc>,
}

impl CheckpointInfo {
    /// Hash the file at `path` and derive its identity
    pub async fn from_file(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read checkpoint for hashing: {:?}", path))?;

        Ok(Self::from_bytes(path, &bytes))
    }

    pub fn from_bytes(path: &Path, bytes: &[u8]) -> Self {
        let sha256 = format!("{:x}", Sha256::digest(bytes));
        let shorthash = sha256[..SHORTHASH_LEN].to_string();
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();

        Self {
            title: format!("{} [{}]", name, shorthash),
            name,
            path: path.to_path_buf(),
            sha256,
            shorthash,
            registered_at: Utc::now(),
        }
    }
}

/// Name → path aliases and title → info records of known checkpoints
pub struct CheckpointRegistry {
    aliases: Arc<RwLock<HashMap<String, PathBuf>>>,
    checkpoints: Arc<RwLock<HashMap<String, CheckpointInfo>>>,
}

impl CheckpointRegistry {
    pub fn new() -> Self {
        Self {
            aliases: Arc::new(RwLock::new(HashMap::new())),
            checkpoints: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a checkpoint under its alias and title, replacing older records
    pub async fn register(&self, info: CheckpointInfo) {
        self.aliases
            .write()
            .await
            .insert(info.name.clone(), info.path.clone());

        tracing::debug!(title = %info.title, path = ?info.path, "Checkpoint registered");

        self.checkpoints
            .write()
            .await
            .insert(info.title.clone(), info);
    }

    pub async fn get(&self, title: &str) -> Option<CheckpointInfo> {
        self.checkpoints.read().await.get(title).cloned()
    }

    pub async fn alias(&self, name: &str) -> Option<PathBuf> {
        self.aliases.read().await.get(name).cloned()
    }

    /// All records sorted by title
    pub async fn list(&self) -> Vec<CheckpointInfo> {
        let checkpoints = self.checkpoints.read().await;
        let mut entries: Vec<_> = checkpoints.values().cloned().collect();
        entries.sort_by(|a, b| a.title.cmp(&b.title));
        entries
    }

    pub async fn count(&self) -> usize {
        self.checkpoints.read().await.len()
    }
}

impl Default for CheckpointRegistry {
    fn default() -> Self {
        Self::new()
    }
}
