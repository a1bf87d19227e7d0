/*!
# keepsql core

Durability and bootstrap layer for an embedded SQLite engine.

The application keeps its whole database in memory and persists it as a single
snapshot image in a small, versioned object store. This crate owns that engine
and everything around it:

- Startup: load the stored snapshot, check it against the running schema,
  and rebuild from a remote seed or the bundled schema when it is unusable
- Debounced auto-save with at most one save in flight
- Capability probing of optional engine features, reported as telemetry
- A narrow execute/run/save/reset/import surface for the rest of the app

## Architecture

The core follows a ports-and-adapters layout:
- [`DatabaseLifecycle`] orchestrates the other components and is the only
  owner of the [`EngineHandle`]
- [`SnapshotStore`] adapts an [`ObjectStore`](storage::ObjectStore) and a
  [`CompressionAdapter`] into save/load/clear/quota operations
- Object stores and seed sources are traits, so hosts plug in their own

## Usage

```rust
use keepsql_core::{DatabaseLifecycle, LifecycleConfig, StorageConfig};

# tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
let config = LifecycleConfig {
    storage: StorageConfig::memory(),
    ..LifecycleConfig::default()
};
let db = DatabaseLifecycle::builder(config).build()?;
db.initialize().await?;

let rows = db.execute("SELECT name FROM nodes ORDER BY name", &[])?;
assert!(!rows.is_empty());
assert!(db.capabilities().unwrap().is_supported("json"));

db.save().await?;
db.shutdown().await?;
# Ok::<(), keepsql_core::KeepError>(())
# }).unwrap();
```
*/

pub mod autosave;
pub mod capability;
pub mod compression;
pub mod config;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod metadata;
pub mod migration;
pub mod observability;
pub mod schema;
pub mod seed;
pub mod snapshot;
pub mod storage;

#[cfg(test)]
mod error_tests;

pub use autosave::{AutoSaveManager, AutoSaveStats, SaveCallback, DEFAULT_AUTOSAVE_DELAY};
pub use capability::{
    CapabilityProber, CapabilityReport, EnvironmentContext, FeatureSupport, TelemetryEntry,
};
pub use compression::{CompressionAdapter, GzipCompressor, NoCompression};
pub use config::{LifecycleConfig, StorageBackend, StorageConfig};
pub use engine::{EngineHandle, Row};
pub use error::{KeepError, Result};
pub use lifecycle::{DatabaseLifecycle, EngineOrigin, LifecycleBuilder, LifecycleState};
pub use metadata::SnapshotMetadata;
pub use migration::{GuardVerdict, RebuildReason, SchemaGuard};
pub use rusqlite::types::Value;
pub use schema::{BundledScripts, CURRENT_SCHEMA_VERSION};
#[cfg(feature = "http-seed")]
pub use seed::HttpSeedFetcher;
pub use seed::{SeedFetcher, SeedResponse};
pub use snapshot::{SnapshotStore, StorageQuotaSnapshot};
