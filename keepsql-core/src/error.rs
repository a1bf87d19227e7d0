/*!
Error types for the keepsql core.
*/

use thiserror::Error;

/// Result type used throughout the keepsql core.
pub type Result<T> = std::result::Result<T, KeepError>;

/// Errors that can occur while loading, validating, persisting or querying the engine.
#[derive(Error, Debug)]
pub enum KeepError {
    /// I/O errors during file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors raised by the embedded SQL engine
    #[error("SQL error: {0}")]
    Sql(#[from] rusqlite::Error),

    /// Compression/decompression errors
    #[error("Compression error: {0}")]
    Compression(String),

    /// Integrity check failures
    #[error("Integrity check failed: expected hash {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    /// The durable object store could not be opened
    #[error("Durable store unavailable: {0}")]
    StoreUnavailable(String),

    /// A save was refused because the store is out of space
    #[error("Storage quota exceeded: {needed} bytes needed, {available} bytes available")]
    QuotaExceeded { needed: u64, available: u64 },

    /// Other object store failures
    #[error("Storage error: {0}")]
    Storage(String),

    /// Stored bytes do not open as a valid engine image
    #[error("Corrupt snapshot: {0}")]
    CorruptSnapshot(String),

    /// Schema version marker or required tables do not match
    #[error("Stale schema: {0}")]
    SchemaStale(String),

    /// Remote seed bytes are not a database image
    #[error("Remote seed rejected: {0}")]
    RemoteSeedInvalid(String),

    /// Remote seed could not be downloaded
    #[error("Seed fetch failed: {0}")]
    SeedFetch(String),

    /// An operation was attempted before startup completed
    #[error("Engine not ready (lifecycle state: {0})")]
    EngineNotReady(String),

    /// Every startup fallback failed
    #[error("Startup failed: {0}")]
    StartupFailed(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
}

impl KeepError {
    /// Create a new compression error
    pub fn compression<S: Into<String>>(msg: S) -> Self {
        Self::Compression(msg.into())
    }

    /// Create a new storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new corrupt snapshot error
    pub fn corrupt<S: Into<String>>(msg: S) -> Self {
        Self::CorruptSnapshot(msg.into())
    }

    /// Create a new stale schema error
    pub fn stale<S: Into<String>>(msg: S) -> Self {
        Self::SchemaStale(msg.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// True when a save failed for lack of space. Hosts warn the user instead of retrying.
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. })
    }

    /// True for errors the startup sequence recovers from by rebuilding the engine.
    pub fn triggers_rebuild(&self) -> bool {
        matches!(
            self,
            Self::CorruptSnapshot(_) | Self::IntegrityCheckFailed { .. } | Self::SchemaStale(_)
        )
    }
}
