//! Configuration structures and loading logic

use crate::models::DEFAULT_CAPACITY;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main loader configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoaderConfig {
    pub api_port: u16,
    /// Directory holding UNet, non-UNet and combined artifacts
    pub models_dir: PathBuf,
    /// Artifact file extension, without the leading dot
    pub artifact_suffix: String,
    pub cache_capacity: usize,
    /// Apply half precision on activation
    pub half_precision: bool,
    /// Overrides the detected accelerator memory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_memory_bytes: Option<u64>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            api_port: default_api_port(),
            models_dir: default_models_dir(),
            artifact_suffix: default_artifact_suffix(),
            cache_capacity: DEFAULT_CAPACITY,
            half_precision: true,
            device_memory_bytes: None,
        }
    }
}

impl LoaderConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        // Environment variable overrides
        if let Ok(port) = std::env::var("UNET_LOADER_API_PORT") {
            config.api_port = port.parse().context("Invalid UNET_LOADER_API_PORT value")?;
        }
        if let Ok(dir) = std::env::var("UNET_LOADER_MODELS_DIR") {
            config.models_dir = PathBuf::from(dir);
        }
        if let Ok(capacity) = std::env::var("UNET_LOADER_CACHE_CAPACITY") {
            config.cache_capacity = capacity
                .parse()
                .context("Invalid UNET_LOADER_CACHE_CAPACITY value")?;
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.api_port < 1024 {
            anyhow::bail!("API port must be >= 1024 (got {})", self.api_port);
        }

        if self.cache_capacity == 0 {
            anyhow::bail!("Cache capacity must be at least 1");
        }

        let suffix = self.artifact_suffix.trim_start_matches('.');
        if suffix.is_empty() {
            anyhow::bail!("Artifact suffix cannot be empty");
        }
        if suffix.contains('/') || suffix.contains('\\') {
            anyhow::bail!(
                "Artifact suffix '{}' cannot contain path separators",
                self.artifact_suffix
            );
        }

        if !self.models_dir.exists() {
            std::fs::create_dir_all(&self.models_dir).with_context(|| {
                format!("Cannot create models directory: {:?}", self.models_dir)
            })?;
        }

        Ok(())
    }
}

// Default functions
fn default_api_port() -> u16 {
    9100
}
fn default_models_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("unet-loader")
        .join("models")
}
fn default_artifact_suffix() -> String {
    "safetensors".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> LoaderConfig {
        LoaderConfig {
            models_dir: dir.path().join("models"),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = LoaderConfig::default();
        assert_eq!(config.api_port, 9100);
        assert_eq!(config.cache_capacity, 3);
        assert_eq!(config.artifact_suffix, "safetensors");
        assert!(config.half_precision);
        assert!(config.models_dir.ends_with("unet-loader/models"));
    }

    #[test]
    fn test_port_validation() {
        let dir = TempDir::new().unwrap();
        let config = LoaderConfig {
            api_port: 500,
            ..config_in(&dir)
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let dir = TempDir::new().unwrap();
        let config = LoaderConfig {
            cache_capacity: 0,
            ..config_in(&dir)
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_suffix_validation() {
        let dir = TempDir::new().unwrap();
        for bad in ["", ".", "a/b", "a\\b"] {
            let config = LoaderConfig {
                artifact_suffix: bad.to_string(),
                ..config_in(&dir)
            };
            assert!(config.validate().is_err(), "suffix {:?} accepted", bad);
        }
    }

    #[test]
    fn test_validate_creates_models_dir() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        config.validate().unwrap();
        assert!(dir.path().join("models").is_dir());
    }

    #[test]
    fn test_load_toml_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
api_port = 9200
models_dir = "/srv/models"
cache_capacity = 5
half_precision = false
device_memory_bytes = 1073741824
"#,
        )
        .unwrap();

        let config: LoaderConfig =
            toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(config.api_port, 9200);
        assert_eq!(config.models_dir, PathBuf::from("/srv/models"));
        assert_eq!(config.cache_capacity, 5);
        assert!(!config.half_precision);
        assert_eq!(config.device_memory_bytes, Some(1 << 30));
        assert_eq!(config.artifact_suffix, "safetensors");
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(LoaderConfig::load(Some(PathBuf::from("/nonexistent/config.toml"))).is_err());
    }
}
