/*!
Durable object store port and its adapters.

The object store is the only persistence primitive the host offers: a small,
versioned, transactional key/value store split into named object stores. The
snapshot layer above it only ever touches two slots, both keyed `"main"`.
*/

pub mod local;
pub mod memory;

use crate::{KeepError, Result};
use async_trait::async_trait;
use bytes::Bytes;

/// Object store holding engine images
pub const SNAPSHOT_STORE: &str = "snapshots";
/// Object store holding snapshot metadata
pub const METADATA_STORE: &str = "metadata";
/// The single key used in both object stores
pub const MAIN_KEY: &str = "main";
/// Layout version requested when opening the store
pub const STORE_LAYOUT_VERSION: u32 = 1;
/// Object stores created by a layout upgrade
pub const OBJECT_STORES: [&str; 2] = [SNAPSHOT_STORE, METADATA_STORE];

/// One operation inside a store transaction
#[derive(Debug, Clone)]
pub enum StoreOp {
    /// Overwrite `key` in `store`
    Put {
        store: &'static str,
        key: String,
        value: Bytes,
    },
    /// Remove every key in `store`
    Clear { store: &'static str },
}

impl StoreOp {
    pub fn put(store: &'static str, key: impl Into<String>, value: Bytes) -> Self {
        Self::Put {
            store,
            key: key.into(),
            value,
        }
    }

    pub fn clear(store: &'static str) -> Self {
        Self::Clear { store }
    }
}

/// Raw usage figures reported by a store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageEstimate {
    /// Bytes currently occupied
    pub usage: u64,
    /// Byte limit, if the store has one
    pub quota: Option<u64>,
}

/// Asynchronous, versioned, transactional object store
///
/// Implementations must apply a `commit` batch all-or-nothing as far as the
/// underlying medium allows, and must report space exhaustion as
/// [`KeepError::QuotaExceeded`] rather than a generic storage error.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Open the store, upgrading its layout when the stored version is older
    /// than `version`. Fails with [`KeepError::StoreUnavailable`] when the
    /// store cannot be opened at all.
    async fn open(&self, version: u32) -> Result<()>;

    /// Apply a batch of operations as one transaction
    async fn commit(&self, ops: Vec<StoreOp>) -> Result<()>;

    /// Read a value; `None` when the key was never written
    async fn get(&self, store: &str, key: &str) -> Result<Option<Bytes>>;

    /// Report current usage and quota
    async fn estimate(&self) -> Result<StorageEstimate>;

    /// Short backend name for logs
    fn backend_name(&self) -> &'static str;
}

/// Refuse a write that would push `usage` past `quota`.
///
/// `freed` is the number of bytes the batch releases (overwritten or cleared
/// values), `incoming` the number it adds.
pub(crate) fn check_quota(usage: u64, freed: u64, incoming: u64, quota: Option<u64>) -> Result<()> {
    let Some(quota) = quota else {
        return Ok(());
    };
    let remaining = usage.saturating_sub(freed);
    if remaining.saturating_add(incoming) > quota {
        return Err(KeepError::QuotaExceeded {
            needed: incoming,
            available: quota.saturating_sub(remaining),
        });
    }
    Ok(())
}

pub use local::LocalObjectStore;
pub use memory::MemoryObjectStore;
