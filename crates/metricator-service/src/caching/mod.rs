//! # Metricator caching
//!
//! Fetching the dataset from the remote source is slow and expensive, so every payload lives in a
//! TTL'd key/value store and clients are served from there.
//!
//! ## Stores
//!
//! A [`CacheStore`] maps string keys to opaque byte payloads, each with its own time to live.
//! Two stores exist:
//!
//! - [`InMemoryStore`]: a size-bounded moka cache, lost on restart.
//! - [`FilesystemStore`]: files below [`Config::cache_dir`], shared by restarts.
//!
//! The filesystem store is used whenever `cache_dir` is configured.
//!
//! Absent and expired entries are reported as `Ok(None)`. Failures of the store itself are
//! reported as [`CacheError`], so callers can tell "not there yet" from "cannot look".
//!
//! ## Metrics
//!
//! Each of these is tagged with the `store` it was served from:
//!
//! - `caches.access`: All reads.
//! - `caches.hit`: Reads that found a live entry.
//! - `caches.miss`: Reads that found nothing, or an expired entry.
//! - `caches.error`: Reads or writes that failed, additionally tagged with the error `kind`.
//! - `caches.write`: Successful writes.
//! - `caches.size`: A histogram of written payload sizes in bytes.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::config::Config;

mod cache_error;
mod fs;
mod memory;

pub use cache_error::{CacheContents, CacheError};
pub use fs::FilesystemStore;
pub use memory::InMemoryStore;

/// A key/value store where every entry carries its own time to live.
pub trait CacheStore: Send + Sync + fmt::Debug {
    /// A short name for logs and metric tags.
    fn name(&self) -> &'static str;

    /// Reads the live entry for `key`, if any.
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, CacheContents<Option<Bytes>>>;

    /// Stores `value` under `key`, replacing any previous entry and its expiry.
    ///
    /// The TTL must be positive.
    fn set<'a>(&'a self, key: &'a str, value: Bytes, ttl: Duration) -> BoxFuture<'a, CacheContents>;
}

/// Typed access to the configured [`CacheStore`].
///
/// Values are stored as JSON.
#[derive(Clone)]
pub struct DataCache {
    store: Arc<dyn CacheStore>,
}

impl fmt::Debug for DataCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DataCache").field(&self.store).finish()
    }
}

impl DataCache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    /// Creates the store selected by the config.
    pub fn from_config(config: &Config) -> std::io::Result<Self> {
        let store: Arc<dyn CacheStore> = match config.cache_dir {
            Some(ref dir) => Arc::new(FilesystemStore::new(dir)?),
            None => Arc::new(InMemoryStore::new(config.cache.in_memory_capacity)),
        };
        tracing::info!(store = store.name(), "using cache store");
        Ok(Self::new(store))
    }

    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }

    /// Reads the raw payload stored under `key`.
    pub async fn get_raw(&self, key: &str) -> CacheContents<Option<Bytes>> {
        let name = self.store.name();
        metric!(counter("caches.access") += 1, "store" => name);

        let result = self.store.get(key).await;
        match &result {
            Ok(Some(_)) => metric!(counter("caches.hit") += 1, "store" => name),
            Ok(None) => metric!(counter("caches.miss") += 1, "store" => name),
            Err(e) => {
                tracing::warn!(key, error = %e, "cache read failed");
                metric!(counter("caches.error") += 1, "store" => name, "kind" => e.kind());
            }
        }
        result
    }

    /// Reads and decodes the value stored under `key`.
    ///
    /// A payload that does not decode as `T` is a [`CacheError::CorruptEntry`].
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> CacheContents<Option<T>> {
        let Some(raw) = self.get_raw(key).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| CacheError::CorruptEntry(format!("cannot decode `{key}`: {e}")))
    }

    /// Stores a raw payload under `key`.
    pub async fn set_raw(&self, key: &str, value: Bytes, ttl: Duration) -> CacheContents {
        let name = self.store.name();
        let size = value.len() as u64;

        let result = self.store.set(key, value, ttl).await;
        match &result {
            Ok(()) => {
                metric!(counter("caches.write") += 1, "store" => name);
                metric!(histogram("caches.size") = size, "store" => name);
            }
            Err(e) => {
                tracing::warn!(key, error = %e, "cache write failed");
                metric!(counter("caches.error") += 1, "store" => name, "kind" => e.kind());
            }
        }
        result
    }

    /// Encodes `value` as JSON and stores it under `key`.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> CacheContents {
        let raw = serde_json::to_vec(value)
            .map_err(|e| CacheError::InvalidArgument(format!("cannot encode `{key}`: {e}")))?;
        self.set_raw(key, Bytes::from(raw), ttl).await
    }
}
