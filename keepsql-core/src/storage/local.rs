/*!
Local filesystem object store.

Layout under the base directory:

```text
<base>/VERSION            layout version written by the last upgrade
<base>/snapshots/main     engine image
<base>/metadata/main      snapshot metadata (JSON)
```
*/

use super::{check_quota, ObjectStore, StorageEstimate, StoreOp, OBJECT_STORES};
use crate::{KeepError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

const VERSION_FILE: &str = "VERSION";
const STAGING_SUFFIX: &str = ".staged";

/// Directory-backed object store
///
/// Every write lands in a staged file that is synced and then renamed over the
/// live one, so a crash leaves either the old or the new value for each key.
/// A crash between two renames of the same batch can still pair a new image
/// with old metadata; the snapshot layer catches that through its content hash.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    base_dir: PathBuf,
    quota: Option<u64>,
}

impl LocalObjectStore {
    /// Create a store rooted at `base_dir` without a byte limit
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            quota: None,
        }
    }

    /// Limit the bytes the store may occupy
    pub fn with_quota(mut self, quota_bytes: u64) -> Self {
        self.quota = Some(quota_bytes);
        self
    }

    /// The base directory
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn store_dir(&self, store: &str) -> PathBuf {
        self.base_dir.join(store)
    }

    fn object_path(&self, store: &str, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.contains(['/', '\\']) || key.starts_with('.') {
            return Err(KeepError::validation(format!("invalid object key: {key:?}")));
        }
        Ok(self.store_dir(store).join(key))
    }

    async fn read_layout_version(&self) -> Result<Option<u32>> {
        match fs::read_to_string(self.base_dir.join(VERSION_FILE)).await {
            Ok(text) => text
                .trim()
                .parse::<u32>()
                .map(Some)
                .map_err(|e| KeepError::StoreUnavailable(format!("unreadable VERSION file: {e}"))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(KeepError::StoreUnavailable(format!(
                "failed to read {}: {e}",
                self.base_dir.display()
            ))),
        }
    }

    async fn upgrade(&self, from: Option<u32>, to: u32) -> Result<()> {
        info!(
            "Upgrading object store at {} from layout {:?} to {}",
            self.base_dir.display(),
            from,
            to
        );
        for name in OBJECT_STORES {
            fs::create_dir_all(self.store_dir(name)).await.map_err(|e| {
                KeepError::StoreUnavailable(format!("failed to create object store {name}: {e}"))
            })?;
        }
        write_synced(&self.base_dir.join(VERSION_FILE), to.to_string().as_bytes())
            .await
            .map_err(|e| KeepError::StoreUnavailable(format!("failed to write VERSION: {e}")))
    }

    async fn file_len(path: &Path) -> Result<u64> {
        match fs::metadata(path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    async fn store_usage(&self, store: &str) -> Result<u64> {
        let mut entries = match fs::read_dir(self.store_dir(store)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut total = 0;
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if meta.is_file() {
                total += meta.len();
            }
        }
        Ok(total)
    }

    async fn usage(&self) -> Result<u64> {
        let mut total = 0;
        for name in OBJECT_STORES {
            total += self.store_usage(name).await?;
        }
        Ok(total)
    }

    async fn clear_store(&self, store: &str) -> Result<()> {
        let mut entries = match fs::read_dir(self.store_dir(store)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                fs::remove_file(entry.path()).await?;
            }
        }
        Ok(())
    }
}

async fn write_synced(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(data).await?;
    file.sync_all().await
}

fn staging_path(path: &Path) -> PathBuf {
    let mut staged = path.as_os_str().to_owned();
    staged.push(STAGING_SUFFIX);
    PathBuf::from(staged)
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn open(&self, version: u32) -> Result<()> {
        fs::create_dir_all(&self.base_dir).await.map_err(|e| {
            KeepError::StoreUnavailable(format!(
                "failed to create {}: {e}",
                self.base_dir.display()
            ))
        })?;

        match self.read_layout_version().await? {
            Some(current) if current > version => Err(KeepError::StoreUnavailable(format!(
                "store layout version {current} is newer than supported version {version}"
            ))),
            Some(current) if current == version => {
                debug!("Object store at {} is current", self.base_dir.display());
                Ok(())
            }
            previous => self.upgrade(previous, version).await,
        }
    }

    async fn commit(&self, ops: Vec<StoreOp>) -> Result<()> {
        // Size the batch first so a refused write leaves nothing behind.
        let mut freed = 0u64;
        let mut incoming = 0u64;
        for op in &ops {
            match op {
                StoreOp::Put { store, key, value } => {
                    freed += Self::file_len(&self.object_path(store, key)?).await?;
                    incoming += value.len() as u64;
                }
                StoreOp::Clear { store } => freed += self.store_usage(store).await?,
            }
        }
        check_quota(self.usage().await?, freed, incoming, self.quota)?;

        let mut staged = Vec::new();
        for op in &ops {
            if let StoreOp::Put { store, key, value } = op {
                let live = self.object_path(store, key)?;
                let tmp = staging_path(&live);
                if let Err(e) = write_synced(&tmp, value).await {
                    for (tmp, _) in &staged {
                        let _ = fs::remove_file(tmp).await;
                    }
                    let _ = fs::remove_file(&tmp).await;
                    return Err(KeepError::storage(format!(
                        "failed to stage {}: {e}",
                        live.display()
                    )));
                }
                staged.push((tmp, live));
            }
        }

        let mut staged = staged.into_iter();
        for op in ops {
            match op {
                StoreOp::Clear { store } => self.clear_store(store).await?,
                StoreOp::Put { .. } => {
                    if let Some((tmp, live)) = staged.next() {
                        fs::rename(&tmp, &live).await.map_err(|e| {
                            KeepError::storage(format!("failed to publish {}: {e}", live.display()))
                        })?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn get(&self, store: &str, key: &str) -> Result<Option<Bytes>> {
        let path = self.object_path(store, key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(KeepError::storage(format!(
                "failed to read {}: {e}",
                path.display()
            ))),
        }
    }

    async fn estimate(&self) -> Result<StorageEstimate> {
        Ok(StorageEstimate {
            usage: self.usage().await?,
            quota: self.quota,
        })
    }

    fn backend_name(&self) -> &'static str {
        "local"
    }
}
