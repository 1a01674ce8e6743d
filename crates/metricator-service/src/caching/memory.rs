use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::BoxFuture;

use super::cache_error::{validate_key, validate_write};
use super::{CacheContents, CacheError, CacheStore};

/// An item saved in the in-memory moka cache.
#[derive(Clone, Debug)]
struct InMemoryItem {
    /// When this item stops being visible to readers.
    deadline: tokio::time::Instant,
    /// The stored payload.
    data: Bytes,
}

type InMemoryCache = moka::future::Cache<String, InMemoryItem>;

/// A [`moka::Expiry`] that evicts items at their [`InMemoryItem`] deadline.
struct EntryExpiration;

/// Returns the time left until `target_time`, or zero if it already elapsed.
fn saturating_duration_since(current_time: Instant, target_time: Instant) -> Option<Duration> {
    Some(
        target_time
            .checked_duration_since(current_time)
            .unwrap_or_default(),
    )
}

impl moka::Expiry<String, InMemoryItem> for EntryExpiration {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &InMemoryItem,
        current_time: Instant,
    ) -> Option<Duration> {
        saturating_duration_since(current_time, value.deadline.into_std())
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &InMemoryItem,
        current_time: Instant,
        _current_duration: Option<Duration>,
    ) -> Option<Duration> {
        saturating_duration_since(current_time, value.deadline.into_std())
    }
}

/// The weight of an entry, in bytes.
///
/// The key and deadline count towards the weight as well.
fn entry_weight(key: &str, data: &Bytes) -> u64 {
    (std::mem::size_of::<InMemoryItem>() + key.len() + data.len()) as u64
}

/// A process-local cache store, bounded by the total size of its payloads.
///
/// Readers never observe an entry past its deadline, regardless of when moka gets around to
/// evicting it.
#[derive(Clone)]
pub struct InMemoryStore {
    cache: InMemoryCache,
    capacity: u64,
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("entries", &self.cache.entry_count())
            .field("weighted_size", &self.cache.weighted_size())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl InMemoryStore {
    pub fn new(capacity: u64) -> Self {
        let cache = InMemoryCache::builder()
            .max_capacity(capacity)
            .name("dataset")
            .expire_after(EntryExpiration)
            .weigher(|k: &String, v: &InMemoryItem| {
                u32::try_from(entry_weight(k, &v.data)).unwrap_or(u32::MAX)
            })
            .build();

        Self { cache, capacity }
    }
}

impl CacheStore for InMemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, CacheContents<Option<Bytes>>> {
        Box::pin(async move {
            validate_key(key)?;
            let Some(item) = self.cache.get(key).await else {
                return Ok(None);
            };
            if tokio::time::Instant::now() >= item.deadline {
                self.cache.invalidate(key).await;
                return Ok(None);
            }
            Ok(Some(item.data))
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: Bytes, ttl: Duration) -> BoxFuture<'a, CacheContents> {
        Box::pin(async move {
            validate_write(key, ttl)?;
            // moka silently drops entries heavier than the whole cache
            let weight = entry_weight(key, &value);
            if weight > self.capacity {
                return Err(CacheError::InvalidArgument(format!(
                    "entry of {weight} bytes exceeds the cache capacity of {} bytes",
                    self.capacity
                )));
            }
            let item = InMemoryItem {
                deadline: tokio::time::Instant::now() + ttl,
                data: value,
            };
            self.cache.insert(key.to_owned(), item).await;
            Ok(())
        })
    }
}
