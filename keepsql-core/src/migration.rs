/*!
Schema migration guard.

Decides whether a stored image may be served as-is. The checks run in a fixed
order and the first failure wins:

1. the bytes open as an engine image,
2. the image carries a schema-version marker,
3. the marker is not older than the compiled-in version,
4. every required table exists.

Any failure means the snapshot is discarded and the database is rebuilt.
*/

use crate::engine::EngineHandle;
use crate::snapshot::SnapshotStore;
use crate::{KeepError, Result};
use std::fmt;
use tracing::{info, warn};

/// Why a snapshot cannot be served
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebuildReason {
    /// The bytes do not open as an engine image
    Corrupt(String),
    /// No schema-version marker (pre-versioning snapshot)
    MissingVersion,
    /// Marker older than the required version
    Stale { found: u32, required: u32 },
    /// Marker matches but tables are missing
    MissingTables(Vec<String>),
}

impl fmt::Display for RebuildReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Corrupt(detail) => write!(f, "snapshot is corrupt: {detail}"),
            Self::MissingVersion => write!(f, "snapshot has no schema version marker"),
            Self::Stale { found, required } => {
                write!(f, "schema version {found} is older than required {required}")
            }
            Self::MissingTables(tables) => {
                write!(f, "required tables missing: {}", tables.join(", "))
            }
        }
    }
}

impl From<RebuildReason> for KeepError {
    fn from(reason: RebuildReason) -> Self {
        match reason {
            RebuildReason::Corrupt(detail) => KeepError::CorruptSnapshot(detail),
            other => KeepError::SchemaStale(other.to_string()),
        }
    }
}

/// Outcome of inspecting an image
#[derive(Debug)]
pub enum GuardVerdict {
    /// The image may be served
    Valid(EngineHandle),
    /// The image must be discarded
    Rebuild(RebuildReason),
}

/// Validates snapshots against the running schema
#[derive(Debug, Clone)]
pub struct SchemaGuard {
    required_version: u32,
    required_tables: Vec<String>,
}

impl SchemaGuard {
    pub fn new(required_version: u32, required_tables: Vec<String>) -> Self {
        Self {
            required_version,
            required_tables,
        }
    }

    pub fn required_version(&self) -> u32 {
        self.required_version
    }

    /// Run the check sequence against raw image bytes
    pub fn inspect(&self, image: &[u8]) -> GuardVerdict {
        let engine = match EngineHandle::open_image(image) {
            Ok(engine) => engine,
            Err(e) => return GuardVerdict::Rebuild(RebuildReason::Corrupt(e.to_string())),
        };
        match self.check_engine(&engine) {
            Ok(()) => GuardVerdict::Valid(engine),
            Err(reason) => {
                if let Err(e) = engine.close() {
                    warn!("Failed to close rejected engine: {}", e);
                }
                GuardVerdict::Rebuild(reason)
            }
        }
    }

    /// Checks 2 to 4 against an already open engine
    pub fn check_engine(&self, engine: &EngineHandle) -> std::result::Result<(), RebuildReason> {
        let version = engine
            .schema_version()
            .map_err(|e| RebuildReason::Corrupt(e.to_string()))?
            .ok_or(RebuildReason::MissingVersion)?;

        if version < self.required_version {
            return Err(RebuildReason::Stale {
                found: version,
                required: self.required_version,
            });
        }
        if version > self.required_version {
            warn!(
                "Snapshot schema version {} is newer than this build's {}; serving it unchanged",
                version, self.required_version
            );
        }

        let mut missing = Vec::new();
        for table in &self.required_tables {
            match engine.table_exists(table) {
                Ok(true) => {}
                Ok(false) => missing.push(table.clone()),
                Err(e) => return Err(RebuildReason::Corrupt(e.to_string())),
            }
        }
        if !missing.is_empty() {
            return Err(RebuildReason::MissingTables(missing));
        }
        Ok(())
    }

    /// Inspect a stored snapshot, clearing the store when it must be rebuilt
    ///
    /// Returns the open engine when the snapshot is valid and `None` when
    /// startup should proceed as if no snapshot existed.
    pub async fn validate_stored(
        &self,
        image: &[u8],
        store: &SnapshotStore,
    ) -> Result<Option<EngineHandle>> {
        match self.inspect(image) {
            GuardVerdict::Valid(engine) => {
                info!("Stored snapshot accepted (engine {})", engine.id());
                Ok(Some(engine))
            }
            GuardVerdict::Rebuild(reason) => {
                warn!("Discarding stored snapshot: {}", reason);
                store.clear().await?;
                Ok(None)
            }
        }
    }
}
