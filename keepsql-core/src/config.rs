//! Configuration for the lifecycle controller and its storage backend
//!
//! This module provides the configuration structures used to build a
//! [`DatabaseLifecycle`](crate::DatabaseLifecycle): which object store backs
//! the snapshots, the schema requirements, the auto-save delay and the
//! optional remote seed.

use crate::compression::{CompressionAdapter, GzipCompressor, NoCompression};
use crate::schema::{default_required_tables, CURRENT_SCHEMA_VERSION};
use crate::storage::{LocalObjectStore, MemoryObjectStore, ObjectStore};
use crate::{KeepError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Scheme selecting the in-process store
pub const MEMORY_URI: &str = "memory://";

/// Enumeration of supported storage backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Directory on the local filesystem
    Local,
    /// In-process store, lost on exit
    Memory,
}

/// Configuration structure for storage backend settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// The storage backend to use
    pub backend: StorageBackend,
    /// Directory for the local backend (defaults to `./keepsql-data`)
    pub local_base_path: Option<PathBuf>,
    /// Byte limit enforced by the store
    pub quota_bytes: Option<u64>,
    /// Gzip snapshots before storing them
    pub compress: bool,
}

impl StorageConfig {
    /// Create a default configuration for local filesystem storage
    pub fn default_local() -> Self {
        StorageConfig {
            backend: StorageBackend::Local,
            local_base_path: None,
            quota_bytes: None,
            compress: true,
        }
    }

    /// Create a local configuration rooted at `path`
    pub fn local_at(path: impl Into<PathBuf>) -> Self {
        StorageConfig {
            local_base_path: Some(path.into()),
            ..Self::default_local()
        }
    }

    /// Create an in-memory configuration
    pub fn memory() -> Self {
        StorageConfig {
            backend: StorageBackend::Memory,
            local_base_path: None,
            quota_bytes: None,
            compress: false,
        }
    }

    /// Parse a storage URI
    ///
    /// Supports formats:
    /// - `memory://` for the in-process store
    /// - `/local/path` or `./relative/path` for a local directory
    pub fn from_uri(uri: &str) -> Result<StorageConfig> {
        if let Some(rest) = uri.strip_prefix(MEMORY_URI) {
            if !rest.is_empty() {
                return Err(KeepError::validation(format!(
                    "Invalid memory URI: unexpected path '{rest}'"
                )));
            }
            Ok(StorageConfig::memory())
        } else if uri.contains("://") {
            Err(KeepError::validation(format!(
                "Unsupported storage URI scheme: {uri}"
            )))
        } else if uri.trim().is_empty() {
            Err(KeepError::validation("Storage URI must not be empty"))
        } else {
            Ok(StorageConfig::local_at(uri))
        }
    }

    /// Directory used by the local backend
    pub fn resolved_base_path(&self) -> PathBuf {
        self.local_base_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("keepsql-data"))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.quota_bytes == Some(0) {
            return Err(KeepError::validation("quota_bytes must be greater than zero"));
        }
        match self.backend {
            StorageBackend::Local => {
                if let Some(path) = &self.local_base_path {
                    if path.as_os_str().is_empty() {
                        return Err(KeepError::validation(
                            "Local backend requires a non-empty base path",
                        ));
                    }
                }
            }
            StorageBackend::Memory => {
                if self.local_base_path.is_some() {
                    return Err(KeepError::validation(
                        "Memory backend does not take a base path",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Build the configured object store
    pub fn build_object_store(&self) -> Arc<dyn ObjectStore> {
        match self.backend {
            StorageBackend::Local => {
                let store = LocalObjectStore::new(self.resolved_base_path());
                match self.quota_bytes {
                    Some(quota) => Arc::new(store.with_quota(quota)),
                    None => Arc::new(store),
                }
            }
            StorageBackend::Memory => match self.quota_bytes {
                Some(quota) => Arc::new(MemoryObjectStore::with_quota(quota)),
                None => Arc::new(MemoryObjectStore::new()),
            },
        }
    }

    /// Build the configured compressor
    pub fn build_compressor(&self) -> Arc<dyn CompressionAdapter> {
        if self.compress {
            Arc::new(GzipCompressor::new())
        } else {
            Arc::new(NoCompression)
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::default_local()
    }
}

/// Settings for [`DatabaseLifecycle`](crate::DatabaseLifecycle)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Schema version this build requires
    pub schema_version: u32,
    /// Tables a snapshot must contain to be served
    pub required_tables: Vec<String>,
    /// Quiet period before an automatic save
    pub autosave_delay_ms: u64,
    /// Optional prebuilt database to download when no snapshot is usable
    pub seed_url: Option<String>,
    /// Timeout for the seed download
    pub seed_timeout_ms: u64,
    pub storage: StorageConfig,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            required_tables: default_required_tables(),
            autosave_delay_ms: 5_000,
            seed_url: None,
            seed_timeout_ms: 10_000,
            storage: StorageConfig::default(),
        }
    }
}

impl LifecycleConfig {
    /// Read a JSON configuration file; missing fields take their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: LifecycleConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn autosave_delay(&self) -> Duration {
        Duration::from_millis(self.autosave_delay_ms)
    }

    pub fn seed_timeout(&self) -> Duration {
        Duration::from_millis(self.seed_timeout_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.schema_version == 0 {
            return Err(KeepError::validation("schema_version must be at least 1"));
        }
        if self.autosave_delay_ms == 0 {
            return Err(KeepError::validation(
                "autosave_delay_ms must be greater than zero",
            ));
        }
        if let Some(url) = &self.seed_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(KeepError::validation(format!(
                    "seed_url must be an http(s) URL: {url}"
                )));
            }
        }
        self.storage.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_local_config() {
        let config = StorageConfig::default_local();
        assert_eq!(config.backend, StorageBackend::Local);
        assert!(config.local_base_path.is_none());
        assert!(config.compress);
        assert_eq!(config.resolved_base_path(), PathBuf::from("keepsql-data"));
    }

    #[test]
    fn test_from_uri_memory() {
        let config = StorageConfig::from_uri("memory://").unwrap();
        assert_eq!(config.backend, StorageBackend::Memory);
        assert!(StorageConfig::from_uri("memory://somewhere").is_err());
    }

    #[test]
    fn test_from_uri_local() {
        let config = StorageConfig::from_uri("/var/lib/keepsql").unwrap();
        assert_eq!(config.backend, StorageBackend::Local);
        assert_eq!(
            config.local_base_path,
            Some(PathBuf::from("/var/lib/keepsql"))
        );
    }

    #[test]
    fn test_from_uri_rejects_other_schemes() {
        let result = StorageConfig::from_uri("s3://bucket/key");
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Unsupported storage URI scheme"));
        assert!(StorageConfig::from_uri("  ").is_err());
    }

    #[test]
    fn test_validate_storage_config() {
        assert!(StorageConfig::default_local().validate().is_ok());
        assert!(StorageConfig::memory().validate().is_ok());

        let mut config = StorageConfig::memory();
        config.local_base_path = Some(PathBuf::from("/tmp"));
        assert!(config.validate().is_err());

        let mut config = StorageConfig::default_local();
        config.quota_bytes = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_lifecycle_defaults() {
        let config = LifecycleConfig::default();
        assert_eq!(config.schema_version, CURRENT_SCHEMA_VERSION);
        assert_eq!(config.autosave_delay(), Duration::from_secs(5));
        assert_eq!(config.required_tables.len(), 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_lifecycle_validation() {
        let mut config = LifecycleConfig::default();
        config.seed_url = Some("ftp://example.com/seed.db".to_string());
        assert!(config.validate().is_err());

        config.seed_url = Some("https://example.com/seed.db".to_string());
        assert!(config.validate().is_ok());

        config.autosave_delay_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_json_file_fills_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("keepsql.json");
        std::fs::write(
            &path,
            r#"{ "autosave_delay_ms": 1500, "storage": { "backend": "memory" } }"#,
        )
        .unwrap();

        let config = LifecycleConfig::from_json_file(&path).unwrap();
        assert_eq!(config.autosave_delay(), Duration::from_millis(1500));
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert!(config.storage.compress);
        assert_eq!(config.schema_version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_from_json_file_rejects_invalid() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{ "schema_version": 0 }"#).unwrap();

        assert!(matches!(
            LifecycleConfig::from_json_file(&path),
            Err(KeepError::Validation(_))
        ));
    }
}
