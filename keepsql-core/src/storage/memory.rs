/*!
In-process object store.

Nothing survives the process, but the store honours the same versioning,
transaction and quota rules as the on-disk adapter. Sharing one
`Arc<MemoryObjectStore>` between two controllers simulates a restart.
*/

use super::{check_quota, ObjectStore, StorageEstimate, StoreOp, OBJECT_STORES};
use crate::{KeepError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct MemoryState {
    layout_version: Option<u32>,
    objects: HashMap<String, HashMap<String, Bytes>>,
    quota: Option<u64>,
}

impl MemoryState {
    fn usage(&self) -> u64 {
        self.objects
            .values()
            .flat_map(|store| store.values())
            .map(|value| value.len() as u64)
            .sum()
    }
}

/// Memory-backed object store
///
/// # Example
/// ```rust
/// use keepsql_core::storage::{MemoryObjectStore, ObjectStore, StoreOp, STORE_LAYOUT_VERSION};
///
/// # tokio_test_block_on(async {
/// let store = MemoryObjectStore::new();
/// store.open(STORE_LAYOUT_VERSION).await?;
/// store.commit(vec![StoreOp::put("snapshots", "main", bytes::Bytes::from_static(b"img"))]).await?;
/// assert!(store.get("snapshots", "main").await?.is_some());
/// # Ok::<(), keepsql_core::KeepError>(())
/// # }).unwrap();
/// # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
/// # }
/// ```
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    state: Mutex<MemoryState>,
    unavailable: AtomicBool,
    open_calls: AtomicUsize,
    commits: AtomicUsize,
}

impl MemoryObjectStore {
    /// Create an empty store without a quota
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store limited to `quota_bytes`
    pub fn with_quota(quota_bytes: u64) -> Self {
        let store = Self::new();
        store.set_quota(Some(quota_bytes));
        store
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Change the byte limit
    pub fn set_quota(&self, quota: Option<u64>) {
        self.state().quota = quota;
    }

    /// Make every subsequent `open` fail, as when the host denies storage access
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of times `open` reached the store
    pub fn open_calls(&self) -> usize {
        self.open_calls.load(Ordering::SeqCst)
    }

    /// Number of committed transactions
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    /// Write a value directly, bypassing versioning and quota
    pub fn insert_raw(&self, store: &str, key: &str, value: impl Into<Bytes>) {
        self.state()
            .objects
            .entry(store.to_string())
            .or_default()
            .insert(key.to_string(), value.into());
    }

    /// Read a value directly
    pub fn get_raw(&self, store: &str, key: &str) -> Option<Bytes> {
        self.state()
            .objects
            .get(store)
            .and_then(|values| values.get(key))
            .cloned()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn open(&self, version: u32) -> Result<()> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        // Let concurrent openers interleave the way a real async open would.
        tokio::task::yield_now().await;

        if self.unavailable.load(Ordering::SeqCst) {
            return Err(KeepError::StoreUnavailable(
                "memory store disabled".to_string(),
            ));
        }

        let mut state = self.state();
        match state.layout_version {
            Some(current) if current > version => Err(KeepError::StoreUnavailable(format!(
                "store layout version {current} is newer than supported version {version}"
            ))),
            Some(current) if current == version => Ok(()),
            _ => {
                for name in OBJECT_STORES {
                    state.objects.entry(name.to_string()).or_default();
                }
                state.layout_version = Some(version);
                Ok(())
            }
        }
    }

    async fn commit(&self, ops: Vec<StoreOp>) -> Result<()> {
        let mut state = self.state();
        if state.layout_version.is_none() {
            return Err(KeepError::storage("memory store has not been opened"));
        }

        let mut freed = 0u64;
        let mut incoming = 0u64;
        for op in &ops {
            match op {
                StoreOp::Put { store, key, value } => {
                    freed += state
                        .objects
                        .get(*store)
                        .and_then(|values| values.get(key))
                        .map_or(0, |old| old.len() as u64);
                    incoming += value.len() as u64;
                }
                StoreOp::Clear { store } => {
                    freed += state
                        .objects
                        .get(*store)
                        .map_or(0, |values| values.values().map(|v| v.len() as u64).sum());
                }
            }
        }
        check_quota(state.usage(), freed, incoming, state.quota)?;

        for op in ops {
            match op {
                StoreOp::Put { store, key, value } => {
                    state
                        .objects
                        .entry(store.to_string())
                        .or_default()
                        .insert(key, value);
                }
                StoreOp::Clear { store } => {
                    if let Some(values) = state.objects.get_mut(store) {
                        values.clear();
                    }
                }
            }
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, store: &str, key: &str) -> Result<Option<Bytes>> {
        Ok(self.get_raw(store, key))
    }

    async fn estimate(&self) -> Result<StorageEstimate> {
        let state = self.state();
        Ok(StorageEstimate {
            usage: state.usage(),
            quota: state.quota,
        })
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
