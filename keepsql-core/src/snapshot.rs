/*!
Snapshot store: the persistence adapter the rest of the core talks to.

This module sits on top of an [`ObjectStore`] and turns its generic
transaction API into the five operations the lifecycle needs: initialize,
save, load, clear and quota estimation. It owns compression, the metadata
encoding and the integrity check of stored images.
*/

use crate::compression::CompressionAdapter;
use crate::storage::{
    ObjectStore, StoreOp, MAIN_KEY, METADATA_STORE, SNAPSHOT_STORE, STORE_LAYOUT_VERSION,
};
use crate::{KeepError, Result, SnapshotMetadata};
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Usage above this percentage raises the warning flag
pub const QUOTA_WARNING_PERCENT: f64 = 80.0;

/// Advisory storage usage sampled at startup
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageQuotaSnapshot {
    pub used_bytes: u64,
    pub quota_bytes: Option<u64>,
    pub percent_used: f64,
    pub warning_flag: bool,
}

impl StorageQuotaSnapshot {
    /// Build a quota snapshot from raw usage figures
    pub fn from_usage(used_bytes: u64, quota_bytes: Option<u64>) -> Self {
        let percent_used = match quota_bytes {
            Some(0) => 100.0,
            Some(quota) => used_bytes as f64 / quota as f64 * 100.0,
            None => 0.0,
        };
        Self {
            used_bytes,
            quota_bytes,
            percent_used,
            warning_flag: percent_used >= QUOTA_WARNING_PERCENT,
        }
    }
}

/// Persistence adapter for engine snapshots
///
/// # Example
/// ```rust
/// use keepsql_core::{NoCompression, SnapshotMetadata, SnapshotStore};
/// use keepsql_core::storage::MemoryObjectStore;
/// use std::sync::Arc;
///
/// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
/// let store = SnapshotStore::new(Arc::new(MemoryObjectStore::new()), Arc::new(NoCompression));
/// store.initialize().await?;
/// assert!(store.load().await?.is_none());
///
/// let image = bytes::Bytes::from_static(b"SQLite format 3\0...");
/// store.save(image.clone(), SnapshotMetadata::new(1)).await?;
/// let (loaded, metadata) = store.load().await?.unwrap();
/// assert_eq!(loaded, image);
/// assert_eq!(metadata.schema_version, 1);
/// # Ok::<(), keepsql_core::KeepError>(())
/// # }).unwrap();
/// ```
pub struct SnapshotStore {
    backend: Arc<dyn ObjectStore>,
    compressor: Arc<dyn CompressionAdapter>,
    connection: OnceCell<()>,
}

impl SnapshotStore {
    /// Create a snapshot store over `backend`, compressing images with `compressor`
    pub fn new(backend: Arc<dyn ObjectStore>, compressor: Arc<dyn CompressionAdapter>) -> Self {
        Self {
            backend,
            compressor,
            connection: OnceCell::new(),
        }
    }

    /// Open the underlying object store
    ///
    /// Idempotent: once the connection exists further calls return
    /// immediately, and concurrent callers share one in-flight open. A failed
    /// open is not cached, so a later call may try again.
    pub async fn initialize(&self) -> Result<()> {
        self.connection
            .get_or_try_init(|| async {
                info!(
                    "Opening {} object store (layout version {})",
                    self.backend.backend_name(),
                    STORE_LAYOUT_VERSION
                );
                self.backend.open(STORE_LAYOUT_VERSION).await
            })
            .await
            .map(|_| ())
    }

    /// Whether `initialize` has succeeded
    pub fn is_initialized(&self) -> bool {
        self.connection.initialized()
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(KeepError::StoreUnavailable(
                "snapshot store has not been initialized".to_string(),
            ))
        }
    }

    /// Overwrite the `"main"` slots with `image` and its metadata
    ///
    /// The content hash and size are computed here. Space exhaustion comes back
    /// as [`KeepError::QuotaExceeded`].
    pub async fn save(&self, image: Bytes, metadata: SnapshotMetadata) -> Result<SnapshotMetadata> {
        self.ensure_connected()?;

        let metadata = metadata.with_content_hash(&image);
        metadata.validate()?;

        let packed = self.compressor.pack(&image)?;
        let encoded_metadata = serde_json::to_vec(&metadata)?;
        debug!(
            "Saving snapshot: {} bytes ({} {} bytes), {} records",
            metadata.size_bytes,
            packed.len(),
            self.compressor.name(),
            metadata.record_count
        );

        self.backend
            .commit(vec![
                StoreOp::put(SNAPSHOT_STORE, MAIN_KEY, Bytes::from(packed)),
                StoreOp::put(METADATA_STORE, MAIN_KEY, Bytes::from(encoded_metadata)),
            ])
            .await?;
        Ok(metadata)
    }

    /// Load the latest snapshot
    ///
    /// Returns `Ok(None)` when nothing was ever saved. Stored bytes that cannot
    /// be unpacked, lack metadata, or fail the integrity check come back as
    /// [`KeepError::CorruptSnapshot`].
    pub async fn load(&self) -> Result<Option<(Bytes, SnapshotMetadata)>> {
        self.ensure_connected()?;

        let Some(stored) = self.backend.get(SNAPSHOT_STORE, MAIN_KEY).await? else {
            return Ok(None);
        };
        let raw_metadata = self
            .backend
            .get(METADATA_STORE, MAIN_KEY)
            .await?
            .ok_or_else(|| KeepError::corrupt("snapshot present without metadata"))?;

        let metadata: SnapshotMetadata = serde_json::from_slice(&raw_metadata)
            .map_err(|e| KeepError::corrupt(format!("unreadable snapshot metadata: {e}")))?;
        if !metadata.is_compatible() {
            return Err(KeepError::corrupt(format!(
                "incompatible metadata format version: {} (current: {})",
                metadata.format_version,
                crate::metadata::METADATA_FORMAT_VERSION
            )));
        }

        let image = self
            .compressor
            .unpack(&stored)
            .map_err(|e| KeepError::corrupt(format!("snapshot does not unpack: {e}")))?;
        metadata.verify_integrity(&image).map_err(|e| {
            warn!("Stored snapshot failed its integrity check: {}", e);
            KeepError::corrupt(e.to_string())
        })?;

        Ok(Some((Bytes::from(image), metadata)))
    }

    /// Remove the stored snapshot and metadata
    pub async fn clear(&self) -> Result<()> {
        self.ensure_connected()?;
        info!("Clearing stored snapshot");
        self.backend
            .commit(vec![
                StoreOp::clear(SNAPSHOT_STORE),
                StoreOp::clear(METADATA_STORE),
            ])
            .await
    }

    /// Sample current usage against the store's quota
    pub async fn estimate_quota(&self) -> Result<StorageQuotaSnapshot> {
        self.ensure_connected()?;
        let estimate = self.backend.estimate().await?;
        Ok(StorageQuotaSnapshot::from_usage(estimate.usage, estimate.quota))
    }
}
