/*!
Snapshot metadata stored next to every engine image.
*/

use crate::{KeepError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Current metadata format version for compatibility tracking
pub const METADATA_FORMAT_VERSION: u8 = 1;

/// Metadata persisted in the `"main"` metadata slot.
///
/// Field names serialize in camelCase so the slot holds
/// `{schemaVersion, lastSaved, recordCount, sizeBytes, ...}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    /// Schema version the image was built against
    pub schema_version: u32,

    /// When the snapshot was written
    pub last_saved: DateTime<Utc>,

    /// Number of rows across the required tables at export time
    pub record_count: u64,

    /// Size of the uncompressed engine image in bytes
    pub size_bytes: u64,

    /// SHA-256 hash of the uncompressed engine image
    #[serde(default)]
    pub content_hash: String,

    /// Format version for compatibility (current: 1)
    #[serde(default = "default_format_version")]
    pub format_version: u8,
}

fn default_format_version() -> u8 {
    METADATA_FORMAT_VERSION
}

impl SnapshotMetadata {
    /// Create metadata for an image built against `schema_version`
    ///
    /// # Example
    /// ```rust
    /// use keepsql_core::SnapshotMetadata;
    ///
    /// let metadata = SnapshotMetadata::new(3).with_content_hash(b"image bytes");
    /// assert_eq!(metadata.schema_version, 3);
    /// assert_eq!(metadata.size_bytes, 11);
    /// ```
    pub fn new(schema_version: u32) -> Self {
        Self {
            schema_version,
            last_saved: Utc::now(),
            record_count: 0,
            size_bytes: 0,
            content_hash: String::new(),
            format_version: METADATA_FORMAT_VERSION,
        }
    }

    /// Set the record count
    pub fn with_record_count(mut self, record_count: u64) -> Self {
        self.record_count = record_count;
        self
    }

    /// Set the content hash and size from the engine image
    pub fn with_content_hash(mut self, image: &[u8]) -> Self {
        self.content_hash = Self::compute_hash(image);
        self.size_bytes = image.len() as u64;
        self
    }

    /// Compute the hex SHA-256 of the provided data
    pub fn compute_hash(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        format!("{:x}", hasher.finalize())
    }

    /// Verify an image against the stored hash
    ///
    /// Metadata written before hashes were recorded carries an empty hash and
    /// is accepted as-is.
    pub fn verify_integrity(&self, image: &[u8]) -> Result<()> {
        if self.content_hash.is_empty() {
            return Ok(());
        }
        let computed_hash = Self::compute_hash(image);
        if computed_hash == self.content_hash {
            Ok(())
        } else {
            Err(KeepError::IntegrityCheckFailed {
                expected: self.content_hash.clone(),
                actual: computed_hash,
            })
        }
    }

    /// Validate that the fields describe a usable snapshot
    pub fn validate(&self) -> Result<()> {
        if self.schema_version == 0 {
            return Err(KeepError::validation("schema_version must be at least 1"));
        }
        if self.size_bytes == 0 {
            return Err(KeepError::validation("size_bytes cannot be zero"));
        }
        Ok(())
    }

    /// Check if this metadata is compatible with the current format version
    pub fn is_compatible(&self) -> bool {
        self.format_version <= METADATA_FORMAT_VERSION
    }
}
