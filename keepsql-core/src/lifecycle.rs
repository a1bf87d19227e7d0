/*!
Database lifecycle controller.

[`DatabaseLifecycle`] owns the single engine handle and runs the startup
sequence:

1. open the durable store, falling back to memory-only mode if it is
   unavailable,
2. load the stored snapshot and pass it through the [`SchemaGuard`],
3. without a usable snapshot, try the remote seed and then the bundled
   schema,
4. ensure baseline reference rows, probe capabilities and sample the quota,
5. publish the engine and move to [`LifecycleState::Ready`].

Startup runs at most once per controller. Concurrent callers share the
in-flight attempt and later callers observe its outcome, including a failure.

Once ready, consumers go through [`execute`](DatabaseLifecycle::execute) and
[`run`](DatabaseLifecycle::run). Every write bumps the data version and arms
the auto-save timer.

# Example
```rust
use keepsql_core::{DatabaseLifecycle, LifecycleConfig, StorageConfig, Value};

# tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
let config = LifecycleConfig {
    storage: StorageConfig::memory(),
    ..LifecycleConfig::default()
};
let db = DatabaseLifecycle::builder(config).build()?;
db.initialize().await?;

db.run(
    "INSERT INTO settings (key, value) VALUES (?1, ?2)",
    &[Value::Text("locale".into()), Value::Text("en".into())],
)?;
assert_eq!(db.data_version(), 1);

db.shutdown().await?;
# Ok::<(), keepsql_core::KeepError>(())
# }).unwrap();
```
*/

use crate::autosave::{AutoSaveManager, AutoSaveStats, SaveCallback};
use crate::capability::{CapabilityProber, CapabilityReport, EnvironmentContext, TelemetryEntry};
use crate::compression::CompressionAdapter;
use crate::config::LifecycleConfig;
use crate::engine::{EngineHandle, Row};
use crate::migration::{GuardVerdict, SchemaGuard};
use crate::observability;
use crate::schema::BundledScripts;
use crate::seed::{validate_seed, SeedFetcher};
use crate::snapshot::{SnapshotStore, StorageQuotaSnapshot};
use crate::storage::ObjectStore;
use crate::{KeepError, Result, SnapshotMetadata};
use bytes::Bytes;
use futures::FutureExt;
use rusqlite::types::Value;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{watch, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Uninitialized,
    Initializing,
    LoadingSnapshot,
    Validating,
    RebuildingFresh,
    RebuildingFromRemoteSeed,
    SnapshotAccepted,
    ProbingCapabilities,
    Ready,
    Flushing,
    Closed,
    Failed,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::LoadingSnapshot => "loading_snapshot",
            Self::Validating => "validating",
            Self::RebuildingFresh => "rebuilding_fresh",
            Self::RebuildingFromRemoteSeed => "rebuilding_from_remote_seed",
            Self::SnapshotAccepted => "snapshot_accepted",
            Self::ProbingCapabilities => "probing_capabilities",
            Self::Ready => "ready",
            Self::Flushing => "flushing",
            Self::Closed => "closed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the published engine came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineOrigin {
    StoredSnapshot,
    RemoteSeed,
    FreshBuild,
    ExternalImage,
}

/// Startup bookkeeping; never reset for the life of the controller
#[derive(Default)]
struct InitializationGuard {
    started: AtomicBool,
    completed: AtomicBool,
    outcome: OnceCell<std::result::Result<(), Arc<KeepError>>>,
}

struct Inner {
    config: LifecycleConfig,
    scripts: BundledScripts,
    store: SnapshotStore,
    guard: SchemaGuard,
    seed: Option<Arc<dyn SeedFetcher>>,
    autosave: AutoSaveManager,
    init: InitializationGuard,
    engine: Mutex<Option<EngineHandle>>,
    state: Mutex<LifecycleState>,
    origin: Mutex<Option<EngineOrigin>>,
    data_version: watch::Sender<u64>,
    persistence_enabled: AtomicBool,
    capabilities: Mutex<Option<CapabilityReport>>,
    storage_quota: Mutex<Option<StorageQuotaSnapshot>>,
    last_error: Mutex<Option<Arc<KeepError>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn state(&self) -> LifecycleState {
        *lock(&self.state)
    }

    fn set_state(&self, next: LifecycleState) {
        let mut state = lock(&self.state);
        if *state != next {
            debug!("Lifecycle: {} -> {}", *state, next);
            *state = next;
        }
    }

    fn record_error(&self, err: KeepError) -> Arc<KeepError> {
        let err = Arc::new(err);
        *lock(&self.last_error) = Some(Arc::clone(&err));
        err
    }

    fn persistence_enabled(&self) -> bool {
        self.persistence_enabled.load(Ordering::SeqCst)
    }

    fn bump_data_version(&self) -> u64 {
        let mut bumped = 0;
        self.data_version.send_modify(|version| {
            *version += 1;
            bumped = *version;
        });
        bumped
    }

    fn with_ready_engine<T>(&self, f: impl FnOnce(&EngineHandle) -> Result<T>) -> Result<T> {
        let state = self.state();
        if state != LifecycleState::Ready {
            return Err(KeepError::EngineNotReady(state.to_string()));
        }
        let slot = lock(&self.engine);
        let engine = slot
            .as_ref()
            .ok_or_else(|| KeepError::EngineNotReady(self.state().to_string()))?;
        f(engine)
    }

    /// Install `engine`, closing whatever was there before
    fn replace_engine(&self, engine: EngineHandle, origin: EngineOrigin) {
        let id = engine.id();
        let previous = lock(&self.engine).replace(engine);
        *lock(&self.origin) = Some(origin);
        if let Some(previous) = previous {
            if let Err(e) = previous.close() {
                warn!("Failed to close replaced engine: {}", e);
            }
        }
        info!("Published engine {} ({:?})", id, origin);
    }

    /// Export the live engine and write it to the store
    async fn persist_current(&self) -> Result<()> {
        if !self.persistence_enabled() {
            debug!("Memory-only mode; nothing to persist");
            return Ok(());
        }

        let (image, metadata) = {
            let slot = lock(&self.engine);
            let engine = slot
                .as_ref()
                .ok_or_else(|| KeepError::EngineNotReady(self.state().to_string()))?;
            let schema_version = engine
                .schema_version()?
                .unwrap_or(self.config.schema_version);
            let record_count = engine.record_count(&self.config.required_tables)?;
            (
                engine.export_image()?,
                SnapshotMetadata::new(schema_version).with_record_count(record_count),
            )
        };
        observability::record_snapshot_size(image.len());

        match self.store.save(image, metadata).await {
            Ok(saved) => {
                info!(
                    "Snapshot saved: {} bytes, {} records",
                    saved.size_bytes, saved.record_count
                );
                Ok(())
            }
            Err(e) => {
                if e.is_quota_exceeded() {
                    error!("Storage quota exhausted; changes are not being saved: {}", e);
                }
                Err(e)
            }
        }
    }

    async fn startup(&self) -> std::result::Result<(), Arc<KeepError>> {
        if self.state() == LifecycleState::Closed {
            warn!("Startup requested after shutdown; ignoring");
            return Err(self.record_error(KeepError::EngineNotReady(
                LifecycleState::Closed.to_string(),
            )));
        }
        self.init.started.store(true, Ordering::SeqCst);
        match self.run_startup().await {
            Ok(()) => {
                self.init.completed.store(true, Ordering::SeqCst);
                self.set_state(LifecycleState::Ready);
                info!(
                    "Database ready (persistence {})",
                    if self.persistence_enabled() {
                        "enabled"
                    } else {
                        "disabled"
                    }
                );
                Ok(())
            }
            Err(e) => {
                error!("Database startup failed: {}", e);
                self.set_state(LifecycleState::Failed);
                Err(self.record_error(e))
            }
        }
    }

    async fn run_startup(&self) -> Result<()> {
        self.set_state(LifecycleState::Initializing);

        match self.store.initialize().await {
            Ok(()) => self.persistence_enabled.store(true, Ordering::SeqCst),
            Err(e) => {
                warn!("Durable store unavailable, continuing in memory-only mode: {}", e);
                self.persistence_enabled.store(false, Ordering::SeqCst);
                self.record_error(e);
            }
        }

        let stored = if self.persistence_enabled() {
            self.load_stored_snapshot().await
        } else {
            None
        };

        let stored = match stored {
            Some(engine) => self.accept_stored(engine).await,
            None => None,
        };
        let (engine, origin) = match stored {
            Some(engine) => (engine, EngineOrigin::StoredSnapshot),
            None => self.rebuild().await?,
        };

        self.replace_engine(engine, origin);

        if origin != EngineOrigin::StoredSnapshot {
            if let Err(e) = self.autosave.force_flush().await {
                warn!("Initial save of rebuilt database failed: {}", e);
                self.record_error(e);
            }
        }

        self.set_state(LifecycleState::ProbingCapabilities);
        let prober = CapabilityProber::new(EnvironmentContext::current(self.persistence_enabled()));
        let report = {
            let slot = lock(&self.engine);
            slot.as_ref().map(|engine| prober.probe(engine))
        };
        if let Some(report) = &report {
            let unsupported = report.unsupported();
            if !unsupported.is_empty() {
                info!("Unsupported engine features: {}", unsupported.join(", "));
            }
        }
        *lock(&self.capabilities) = report;

        if self.persistence_enabled() {
            match self.store.estimate_quota().await {
                Ok(quota) => {
                    if quota.warning_flag {
                        warn!(
                            "Storage {:.1}% full ({} of {:?} bytes)",
                            quota.percent_used, quota.used_bytes, quota.quota_bytes
                        );
                    }
                    *lock(&self.storage_quota) = Some(quota);
                }
                Err(e) => debug!("Storage quota estimate unavailable: {}", e),
            }
        }

        Ok(())
    }

    /// Load and validate the stored snapshot; `None` means rebuild
    async fn load_stored_snapshot(&self) -> Option<EngineHandle> {
        self.set_state(LifecycleState::LoadingSnapshot);
        match self.store.load().await {
            Ok(Some((image, metadata))) => {
                self.set_state(LifecycleState::Validating);
                debug!(
                    "Loaded snapshot: schema v{}, {} bytes, saved {}",
                    metadata.schema_version, metadata.size_bytes, metadata.last_saved
                );
                match self.guard.validate_stored(&image, &self.store).await {
                    Ok(engine) => engine,
                    Err(e) => {
                        warn!("Failed to discard rejected snapshot: {}", e);
                        None
                    }
                }
            }
            Ok(None) => {
                info!("No stored snapshot");
                None
            }
            Err(e) if e.triggers_rebuild() => {
                self.set_state(LifecycleState::Validating);
                warn!("Discarding unreadable snapshot: {}", e);
                if let Err(e) = self.store.clear().await {
                    warn!("Failed to clear store: {}", e);
                }
                None
            }
            Err(e) => {
                warn!("Snapshot load failed, rebuilding: {}", e);
                None
            }
        }
    }

    /// Apply the baseline to a validated snapshot; `None` means rebuild
    async fn accept_stored(&self, engine: EngineHandle) -> Option<EngineHandle> {
        match self.scripts.ensure_baseline(&engine) {
            Ok(()) => {
                self.set_state(LifecycleState::SnapshotAccepted);
                Some(engine)
            }
            Err(e) => {
                warn!("Stored snapshot rejects baseline data, rebuilding: {}", e);
                if let Err(e) = engine.close() {
                    debug!("Failed to close rejected engine: {}", e);
                }
                if let Err(e) = self.store.clear().await {
                    warn!("Failed to clear store: {}", e);
                }
                None
            }
        }
    }

    /// Remote seed first, bundled schema as the fallback
    ///
    /// The returned engine already carries the baseline rows.
    async fn rebuild(&self) -> Result<(EngineHandle, EngineOrigin)> {
        if let Some(seed) = &self.seed {
            self.set_state(LifecycleState::RebuildingFromRemoteSeed);
            match self.fetch_seed(seed.as_ref()).await {
                Ok(engine) => return Ok((engine, EngineOrigin::RemoteSeed)),
                Err(e) => warn!(
                    "Remote seed from {} unusable, building fresh: {}",
                    seed.describe(),
                    e
                ),
            }
        }

        self.set_state(LifecycleState::RebuildingFresh);
        let engine = self.scripts.build_fresh(self.config.schema_version)?;
        self.scripts.ensure_baseline(&engine)?;
        Ok((engine, EngineOrigin::FreshBuild))
    }

    async fn fetch_seed(&self, seed: &dyn SeedFetcher) -> Result<EngineHandle> {
        info!("Fetching remote seed from {}", seed.describe());
        let image = validate_seed(seed.fetch().await?)?;
        let engine = match self.guard.inspect(&image) {
            GuardVerdict::Valid(engine) => engine,
            GuardVerdict::Rebuild(reason) => {
                return Err(KeepError::RemoteSeedInvalid(reason.to_string()));
            }
        };
        if let Err(e) = self.scripts.ensure_baseline(&engine) {
            if let Err(close_err) = engine.close() {
                debug!("Failed to close rejected seed engine: {}", close_err);
            }
            return Err(KeepError::RemoteSeedInvalid(format!(
                "baseline data rejected: {e}"
            )));
        }
        Ok(engine)
    }
}

/// Builder for [`DatabaseLifecycle`]
pub struct LifecycleBuilder {
    config: LifecycleConfig,
    object_store: Option<Arc<dyn ObjectStore>>,
    compressor: Option<Arc<dyn CompressionAdapter>>,
    seed: Option<Arc<dyn SeedFetcher>>,
    scripts: BundledScripts,
}

impl LifecycleBuilder {
    /// Use this store instead of the one described by the config
    pub fn object_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.object_store = Some(store);
        self
    }

    pub fn compressor(mut self, compressor: Arc<dyn CompressionAdapter>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    /// Use this seed source instead of `seed_url`
    pub fn seed_fetcher(mut self, seed: Arc<dyn SeedFetcher>) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Replace the compiled-in schema, sample data and baseline scripts
    pub fn scripts(mut self, scripts: BundledScripts) -> Self {
        self.scripts = scripts;
        self
    }

    pub fn build(self) -> Result<DatabaseLifecycle> {
        self.config.validate()?;

        let object_store = match self.object_store {
            Some(store) => store,
            None => self.config.storage.build_object_store(),
        };
        let compressor = match self.compressor {
            Some(compressor) => compressor,
            None => self.config.storage.build_compressor(),
        };
        let seed = match self.seed {
            Some(seed) => Some(seed),
            None => default_seed_fetcher(&self.config)?,
        };

        let config = self.config;
        let scripts = self.scripts;
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let weak = weak.clone();
            let save: SaveCallback = Arc::new(move || {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(inner) => inner.persist_current().await,
                        None => Ok(()),
                    }
                }
                .boxed()
            });
            let (data_version, _) = watch::channel(0);

            Inner {
                guard: SchemaGuard::new(config.schema_version, config.required_tables.clone()),
                autosave: AutoSaveManager::new(config.autosave_delay(), save),
                store: SnapshotStore::new(object_store, compressor),
                config,
                scripts,
                seed,
                init: InitializationGuard::default(),
                engine: Mutex::new(None),
                state: Mutex::new(LifecycleState::Uninitialized),
                origin: Mutex::new(None),
                data_version,
                persistence_enabled: AtomicBool::new(false),
                capabilities: Mutex::new(None),
                storage_quota: Mutex::new(None),
                last_error: Mutex::new(None),
            }
        });

        Ok(DatabaseLifecycle { inner })
    }
}

#[cfg(feature = "http-seed")]
fn default_seed_fetcher(config: &LifecycleConfig) -> Result<Option<Arc<dyn SeedFetcher>>> {
    match &config.seed_url {
        Some(url) => {
            let fetcher = crate::seed::HttpSeedFetcher::new(url.clone(), config.seed_timeout())?;
            Ok(Some(Arc::new(fetcher)))
        }
        None => Ok(None),
    }
}

#[cfg(not(feature = "http-seed"))]
fn default_seed_fetcher(config: &LifecycleConfig) -> Result<Option<Arc<dyn SeedFetcher>>> {
    if config.seed_url.is_some() {
        warn!("seed_url is set but keepsql was built without the http-seed feature");
    }
    Ok(None)
}

/// Owner of the embedded database
///
/// Cheap to clone; clones share the same engine.
#[derive(Clone)]
pub struct DatabaseLifecycle {
    inner: Arc<Inner>,
}

impl fmt::Debug for DatabaseLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseLifecycle")
            .field("state", &self.state())
            .field("data_version", &self.data_version())
            .field("persistence_enabled", &self.persistence_enabled())
            .finish()
    }
}

impl DatabaseLifecycle {
    pub fn builder(config: LifecycleConfig) -> LifecycleBuilder {
        LifecycleBuilder {
            config,
            object_store: None,
            compressor: None,
            seed: None,
            scripts: BundledScripts::default(),
        }
    }

    /// Run the startup sequence
    ///
    /// May be called any number of times, concurrently or not; only the first
    /// call does the work. A failed startup is not retried and every call
    /// reports it as [`KeepError::StartupFailed`].
    pub async fn initialize(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.init.started.load(Ordering::SeqCst) {
            debug!("Startup already started; joining it");
        }
        let outcome = inner
            .init
            .outcome
            .get_or_init(|| inner.startup())
            .await;
        outcome
            .as_ref()
            .map(|_| ())
            .map_err(|e| KeepError::StartupFailed(e.to_string()))
    }

    /// Run one statement and return its rows
    ///
    /// Writes bump the data version and schedule an auto-save. Statement
    /// errors are returned unchanged.
    pub fn execute(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let outcome = self
            .inner
            .with_ready_engine(|engine| engine.execute(sql, params))?;
        if outcome.mutated {
            self.record_write();
        }
        Ok(outcome.rows)
    }

    /// Run one statement, discarding any rows
    pub fn run(&self, sql: &str, params: &[Value]) -> Result<()> {
        self.execute(sql, params).map(|_| ())
    }

    fn record_write(&self) {
        let version = self.inner.bump_data_version();
        debug!("Data version {}", version);
        self.inner.autosave.notify_changed();
    }

    /// Save now
    pub async fn save(&self) -> Result<()> {
        self.ensure_ready()?;
        self.inner.autosave.force_flush().await
    }

    /// Discard all data and start over from the bundled schema
    pub async fn reset(&self) -> Result<()> {
        self.ensure_ready()?;
        info!("Resetting database");
        self.inner.autosave.cancel_pending();

        let engine = self
            .inner
            .scripts
            .build_fresh(self.inner.config.schema_version)?;
        self.inner.scripts.ensure_baseline(&engine)?;
        self.inner.replace_engine(engine, EngineOrigin::FreshBuild);
        self.inner.bump_data_version();

        if self.inner.persistence_enabled() {
            self.inner.store.clear().await?;
        }
        self.inner.autosave.force_flush().await
    }

    /// Replace the database with an image from outside, e.g. a file the user
    /// opened
    ///
    /// The image must pass the same checks as a stored snapshot. A rejected
    /// image leaves the current database and the store untouched.
    pub async fn load_from_external_image(&self, image: &[u8]) -> Result<()> {
        self.ensure_ready()?;
        let engine = match self.inner.guard.inspect(image) {
            GuardVerdict::Valid(engine) => engine,
            GuardVerdict::Rebuild(reason) => {
                warn!("External image rejected: {}", reason);
                return Err(reason.into());
            }
        };
        self.inner.autosave.cancel_pending();
        self.inner.replace_engine(engine, EngineOrigin::ExternalImage);
        self.inner.bump_data_version();
        self.inner.autosave.force_flush().await
    }

    /// The current database as an image
    pub fn export_image(&self) -> Result<Bytes> {
        self.inner.with_ready_engine(|engine| engine.export_image())
    }

    /// Flush for a host suspend; the engine stays open
    ///
    /// Returns `true` when unsaved changes were flushed, so the host can warn
    /// the user that leaving may take a moment.
    pub async fn suspend(&self) -> bool {
        if self.state() != LifecycleState::Ready {
            return false;
        }
        match self.inner.autosave.flush_on_terminate().await {
            Ok(flushed) => flushed,
            Err(e) => {
                warn!("Flush on suspend failed: {}", e);
                self.inner.record_error(e);
                true
            }
        }
    }

    /// Flush and close the engine for process exit
    ///
    /// A startup still in progress is awaited first, so a closed controller
    /// never reopens. The engine is closed even if the flush fails; the flush
    /// error is returned.
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.init.started.load(Ordering::SeqCst) && !self.inner.init.outcome.initialized()
        {
            debug!("Shutdown waiting for startup to finish");
            // Its outcome is already recorded; close either way.
            let _ = self.initialize().await;
        }

        let state = self.state();
        if state == LifecycleState::Closed {
            return Ok(());
        }

        let flushed = if state == LifecycleState::Ready {
            self.inner.set_state(LifecycleState::Flushing);
            self.inner.autosave.force_flush().await
        } else {
            Ok(())
        };
        if let Err(e) = &flushed {
            warn!("Final flush failed: {}", e);
        }
        self.inner.autosave.cancel_pending();

        let engine = lock(&self.inner.engine).take();
        if let Some(engine) = engine {
            if let Err(e) = engine.close() {
                warn!("Failed to close engine: {}", e);
            }
        }
        self.inner.set_state(LifecycleState::Closed);
        info!("Database closed");

        flushed.map_err(|e| {
            self.inner
                .record_error(KeepError::storage(format!("final flush failed: {e}")));
            e
        })
    }

    /// Shut down when `signal` resolves
    ///
    /// The host's termination signal is unreliable; auto-save is what bounds
    /// data loss, this only shortens the window.
    pub fn watch_termination<F>(&self, signal: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let lifecycle = self.clone();
        tokio::spawn(async move {
            signal.await;
            info!("Termination signal received");
            if let Err(e) = lifecycle.shutdown().await {
                warn!("Shutdown after termination signal failed: {}", e);
            }
        })
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state() {
            LifecycleState::Ready => Ok(()),
            other => Err(KeepError::EngineNotReady(other.to_string())),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.state()
    }

    pub fn engine_ready(&self) -> bool {
        self.state() == LifecycleState::Ready
    }

    /// Whether startup has begun and whether it finished successfully
    pub fn initialization_status(&self) -> (bool, bool) {
        (
            self.inner.init.started.load(Ordering::SeqCst),
            self.inner.init.completed.load(Ordering::SeqCst),
        )
    }

    /// Most recent recorded error
    pub fn last_error(&self) -> Option<Arc<KeepError>> {
        lock(&self.inner.last_error).clone()
    }

    pub fn capabilities(&self) -> Option<CapabilityReport> {
        lock(&self.inner.capabilities).clone()
    }

    /// Telemetry for features that failed their probe
    pub fn telemetry(&self) -> Vec<TelemetryEntry> {
        lock(&self.inner.capabilities)
            .as_ref()
            .map(|report| report.telemetry.clone())
            .unwrap_or_default()
    }

    /// Counter bumped on every write, reset and import
    pub fn data_version(&self) -> u64 {
        *self.inner.data_version.borrow()
    }

    /// Receiver notified whenever the data version changes
    pub fn subscribe_data_version(&self) -> watch::Receiver<u64> {
        self.inner.data_version.subscribe()
    }

    pub fn storage_quota(&self) -> Option<StorageQuotaSnapshot> {
        *lock(&self.inner.storage_quota)
    }

    /// False when running memory-only because the store could not be opened
    pub fn persistence_enabled(&self) -> bool {
        self.inner.persistence_enabled()
    }

    pub fn autosave_stats(&self) -> AutoSaveStats {
        self.inner.autosave.stats()
    }

    pub fn engine_origin(&self) -> Option<EngineOrigin> {
        *lock(&self.inner.origin)
    }

    /// Id of the live engine handle
    pub fn engine_id(&self) -> Option<Uuid> {
        lock(&self.inner.engine).as_ref().map(EngineHandle::id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::schema::{build_fresh, CURRENT_SCHEMA_VERSION};
    use crate::seed::{MockSeedFetcher, SeedResponse};
    use crate::storage::MemoryObjectStore;

    fn memory_config() -> LifecycleConfig {
        LifecycleConfig {
            storage: StorageConfig::memory(),
            ..LifecycleConfig::default()
        }
    }

    fn seed_returning(response: Result<SeedResponse>, times: usize) -> MockSeedFetcher {
        let mut seed = MockSeedFetcher::new();
        seed.expect_describe()
            .return_const("mock://seed".to_string());
        let response = Arc::new(Mutex::new(Some(response)));
        seed.expect_fetch().times(times).returning(move || {
            response
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| Err(KeepError::SeedFetch("exhausted".into())))
        });
        seed
    }

    fn seed_image() -> Bytes {
        let engine = build_fresh(CURRENT_SCHEMA_VERSION).unwrap();
        engine
            .run(
                "INSERT INTO settings (key, value) VALUES ('seeded', 'yes')",
                &[],
            )
            .unwrap();
        engine.export_image().unwrap()
    }

    fn setting(db: &DatabaseLifecycle, key: &str) -> Option<String> {
        db.execute(
            "SELECT value FROM settings WHERE key = ?1",
            &[Value::Text(key.to_string())],
        )
        .unwrap()
        .first()
        .and_then(|row| row.get_str("value").map(str::to_string))
    }

    #[tokio::test]
    async fn test_operations_before_startup_are_rejected() {
        let db = DatabaseLifecycle::builder(memory_config()).build().unwrap();

        let err = db.execute("SELECT 1", &[]).unwrap_err();
        assert!(matches!(err, KeepError::EngineNotReady(ref s) if s == "uninitialized"));
        assert!(matches!(db.save().await, Err(KeepError::EngineNotReady(_))));
        assert_eq!(db.initialization_status(), (false, false));
    }

    #[tokio::test]
    async fn test_valid_remote_seed_is_preferred() {
        let seed = seed_returning(
            Ok(SeedResponse {
                content_type: Some("application/x-sqlite3".into()),
                body: seed_image(),
            }),
            1,
        );
        let db = DatabaseLifecycle::builder(memory_config())
            .seed_fetcher(Arc::new(seed))
            .build()
            .unwrap();
        db.initialize().await.unwrap();

        assert_eq!(db.engine_origin(), Some(EngineOrigin::RemoteSeed));
        assert_eq!(setting(&db, "seeded").as_deref(), Some("yes"));
        assert_eq!(db.data_version(), 0);
    }

    #[tokio::test]
    async fn test_html_seed_falls_back_to_fresh_build() {
        let seed = seed_returning(
            Ok(SeedResponse {
                content_type: Some("text/html".into()),
                body: seed_image(),
            }),
            1,
        );
        let db = DatabaseLifecycle::builder(memory_config())
            .seed_fetcher(Arc::new(seed))
            .build()
            .unwrap();
        db.initialize().await.unwrap();

        assert_eq!(db.engine_origin(), Some(EngineOrigin::FreshBuild));
        assert_eq!(setting(&db, "seeded"), None);
        assert!(db.engine_ready());
    }

    #[tokio::test]
    async fn test_headerless_seed_falls_back_to_fresh_build() {
        let seed = seed_returning(
            Ok(SeedResponse {
                content_type: Some("application/octet-stream".into()),
                body: Bytes::from_static(b"<html><body>404</body></html>"),
            }),
            1,
        );
        let db = DatabaseLifecycle::builder(memory_config())
            .seed_fetcher(Arc::new(seed))
            .build()
            .unwrap();
        db.initialize().await.unwrap();

        assert_eq!(db.engine_origin(), Some(EngineOrigin::FreshBuild));
    }

    #[tokio::test]
    async fn test_stale_seed_falls_back_to_fresh_build() {
        let stale = build_fresh(CURRENT_SCHEMA_VERSION - 1)
            .unwrap()
            .export_image()
            .unwrap();
        let seed = seed_returning(
            Ok(SeedResponse {
                content_type: None,
                body: stale,
            }),
            1,
        );
        let db = DatabaseLifecycle::builder(memory_config())
            .seed_fetcher(Arc::new(seed))
            .build()
            .unwrap();
        db.initialize().await.unwrap();

        assert_eq!(db.engine_origin(), Some(EngineOrigin::FreshBuild));
    }

    #[tokio::test]
    async fn test_seed_not_fetched_when_snapshot_is_valid() {
        let backend = Arc::new(MemoryObjectStore::new());

        let first = DatabaseLifecycle::builder(memory_config())
            .object_store(backend.clone())
            .build()
            .unwrap();
        first.initialize().await.unwrap();
        first.shutdown().await.unwrap();

        let seed = seed_returning(Err(KeepError::SeedFetch("unused".into())), 0);
        let second = DatabaseLifecycle::builder(memory_config())
            .object_store(backend)
            .seed_fetcher(Arc::new(seed))
            .build()
            .unwrap();
        second.initialize().await.unwrap();

        assert_eq!(second.engine_origin(), Some(EngineOrigin::StoredSnapshot));
    }

    #[tokio::test]
    async fn test_concurrent_initialize_runs_startup_once() {
        let backend = Arc::new(MemoryObjectStore::new());
        let seed = seed_returning(Err(KeepError::SeedFetch("offline".into())), 1);
        let db = DatabaseLifecycle::builder(memory_config())
            .object_store(backend.clone())
            .seed_fetcher(Arc::new(seed))
            .build()
            .unwrap();

        let other = db.clone();
        let (a, b, c) = tokio::join!(db.initialize(), other.initialize(), db.initialize());
        assert!(a.is_ok() && b.is_ok() && c.is_ok());

        let id = db.engine_id().unwrap();
        db.initialize().await.unwrap();
        assert_eq!(db.engine_id(), Some(id));
        assert_eq!(backend.open_calls(), 1);
        assert_eq!(db.initialization_status(), (true, true));
    }

    #[tokio::test]
    async fn test_failed_startup_is_cached() {
        let seed = seed_returning(Err(KeepError::SeedFetch("offline".into())), 1);
        let db = DatabaseLifecycle::builder(memory_config())
            .seed_fetcher(Arc::new(seed))
            .scripts(BundledScripts {
                schema: "CREATE TABLE broken (".into(),
                ..BundledScripts::default()
            })
            .build()
            .unwrap();

        assert!(matches!(
            db.initialize().await,
            Err(KeepError::StartupFailed(_))
        ));
        assert!(matches!(
            db.initialize().await,
            Err(KeepError::StartupFailed(_))
        ));
        assert_eq!(db.state(), LifecycleState::Failed);
        assert!(db.last_error().is_some());
        assert_eq!(db.initialization_status(), (true, false));
        assert!(matches!(
            db.execute("SELECT 1", &[]),
            Err(KeepError::EngineNotReady(ref s)) if s == "failed"
        ));
    }

    #[tokio::test]
    async fn test_unavailable_store_runs_memory_only() {
        let backend = Arc::new(MemoryObjectStore::new());
        backend.set_unavailable(true);
        let db = DatabaseLifecycle::builder(memory_config())
            .object_store(backend.clone())
            .build()
            .unwrap();
        db.initialize().await.unwrap();

        assert!(db.engine_ready());
        assert!(!db.persistence_enabled());
        assert!(matches!(
            db.last_error().as_deref(),
            Some(KeepError::StoreUnavailable(_))
        ));
        assert!(db.storage_quota().is_none());

        db.run("DELETE FROM nodes", &[]).unwrap();
        db.save().await.unwrap();
        assert_eq!(backend.commit_count(), 0);

        let capabilities = db.capabilities().unwrap();
        assert!(capabilities.is_supported("json"));
    }

    #[tokio::test]
    async fn test_rejected_external_image_keeps_current_state() {
        let db = DatabaseLifecycle::builder(memory_config()).build().unwrap();
        db.initialize().await.unwrap();
        let id = db.engine_id();

        let result = db.load_from_external_image(b"not a database").await;
        assert!(matches!(result, Err(KeepError::CorruptSnapshot(_))));

        let stale = build_fresh(CURRENT_SCHEMA_VERSION - 1)
            .unwrap()
            .export_image()
            .unwrap();
        let result = db.load_from_external_image(&stale).await;
        assert!(matches!(result, Err(KeepError::SchemaStale(_))));

        assert_eq!(db.engine_id(), id);
        assert_eq!(db.data_version(), 0);
    }

    #[tokio::test]
    async fn test_data_version_subscription() {
        let db = DatabaseLifecycle::builder(memory_config()).build().unwrap();
        db.initialize().await.unwrap();
        let mut versions = db.subscribe_data_version();

        db.run("UPDATE settings SET value = 'dark' WHERE key = 'theme'", &[])
            .unwrap();
        versions.changed().await.unwrap();
        assert_eq!(*versions.borrow(), 1);

        db.execute("SELECT * FROM nodes", &[]).unwrap();
        assert!(!versions.has_changed().unwrap());
    }
}
