use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use super::cache_error::{validate_key, validate_write};
use super::{CacheContents, CacheError, CacheStore};

/// Sidecar stored next to every data file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct EntryMetadata {
    /// The original cache key, the file name only carries its hash.
    pub key: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// A cache store that persists entries to a directory, so they survive restarts.
///
/// Every key maps to a data file named after the SHA-256 of the key, plus a `.metadata` JSON
/// sidecar holding the expiry. Both are written to a temp file first and then moved into place.
#[derive(Debug, Clone)]
pub struct FilesystemStore {
    inner: Arc<FsInner>,
}

#[derive(Debug)]
struct FsInner {
    cache_dir: PathBuf,
    tmp_dir: PathBuf,
}

impl FilesystemStore {
    /// Opens a store rooted at `cache_dir`, creating the directory if needed.
    pub fn new(cache_dir: &Path) -> io::Result<Self> {
        let tmp_dir = cache_dir.join("tmp");
        fs::create_dir_all(&tmp_dir)?;

        Ok(Self {
            inner: Arc::new(FsInner {
                cache_dir: cache_dir.to_owned(),
                tmp_dir,
            }),
        })
    }

    fn data_path(&self, key: &str) -> PathBuf {
        self.inner.data_path(key)
    }
}

impl FsInner {
    fn data_path(&self, key: &str) -> PathBuf {
        let hash = Sha256::digest(key.as_bytes());
        self.cache_dir.join(hex::encode(hash))
    }

    fn read(&self, key: &str) -> CacheContents<Option<Bytes>> {
        let data_path = self.data_path(key);
        let md_path = metadata_path(&data_path);

        let raw_metadata = match fs::read(&md_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let metadata: EntryMetadata = serde_json::from_slice(&raw_metadata).map_err(|e| {
            tracing::warn!(path = %md_path.display(), error = %e, "unreadable cache metadata");
            CacheError::CorruptEntry(format!("bad metadata for `{key}`: {e}"))
        })?;
        if metadata.key != key {
            return Err(CacheError::CorruptEntry(format!(
                "metadata for `{key}` belongs to `{}`",
                metadata.key
            )));
        }

        if Utc::now() >= metadata.expires_at {
            tracing::trace!(key, "cache entry expired");
            return Ok(None);
        }

        match fs::read(&data_path) {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, key: &str, value: &[u8], ttl: Duration) -> CacheContents {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|_| CacheError::InvalidArgument(format!("ttl {ttl:?} is out of range")))?;
        let created_at = Utc::now();
        let metadata = EntryMetadata {
            key: key.to_owned(),
            created_at,
            expires_at: created_at + ttl,
        };
        let raw_metadata = serde_json::to_vec(&metadata)
            .map_err(|e| CacheError::StoreUnavailable(e.to_string()))?;

        let data_path = self.data_path(key);
        self.persist(&data_path, value)?;
        self.persist(&metadata_path(&data_path), &raw_metadata)?;
        Ok(())
    }

    fn persist(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        fs::create_dir_all(&self.tmp_dir)?;
        let mut temp_file = NamedTempFile::new_in(&self.tmp_dir)?;
        temp_file.write_all(contents)?;
        temp_file.flush()?;
        temp_file.persist(path).map_err(|e| {
            sentry::with_scope(
                |scope| scope.set_extra("path", path.display().to_string().into()),
                || tracing::error!("Failed to persist cache file: {:?}", e.error),
            );
            e.error
        })?;
        Ok(())
    }
}

/// Returns the path of the metadata sidecar belonging to a data file.
fn metadata_path(data_path: &Path) -> PathBuf {
    data_path.with_extension("metadata")
}

impl CacheStore for FilesystemStore {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, CacheContents<Option<Bytes>>> {
        Box::pin(async move {
            validate_key(key)?;
            let inner = Arc::clone(&self.inner);
            let key = key.to_owned();
            tokio::task::spawn_blocking(move || inner.read(&key))
                .await
                .map_err(|e| CacheError::StoreUnavailable(e.to_string()))?
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: Bytes, ttl: Duration) -> BoxFuture<'a, CacheContents> {
        Box::pin(async move {
            validate_write(key, ttl)?;
            let inner = Arc::clone(&self.inner);
            let key = key.to_owned();
            tokio::task::spawn_blocking(move || inner.write(&key, &value, ttl))
                .await
                .map_err(|e| CacheError::StoreUnavailable(e.to_string()))?
        })
    }
}
