//! Single-flight refreshes of cached keys.
//!
//! A refresh is started by a cache miss, a [`Scheduler`] tick, or an operator. It first takes
//! the key's [refresh lease](LeaseManager): whoever fails to get it is told that a refresh is
//! already in progress and moves on, nobody ever waits for a lease. The lease holder runs a
//! [`FetchJob`] on the io runtime, which retries failed fetches with [`Backoff`] while holding
//! on to the lease, and releases it once the job is terminal.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use sentry::{Hub, SentryFutureExt};
use serde::de::DeserializeOwned;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::Instrument;

use crate::caching::{CacheContents, CacheError, DataCache};

mod backoff;
mod job;
mod lease;
mod scheduler;
mod source;

pub use backoff::{Backoff, BackoffStrategy};
pub use job::{FetchHandle, FetchJob, FetchOutcome, FetchPolicy, FetchSnapshot, FetchState, Trigger};
pub use lease::{HolderId, InMemoryLeases, LeaseGuard, LeaseManager, RefreshLease};
pub use scheduler::Scheduler;
pub use source::{FetchError, HttpSource, RemoteSource};

/// Result of a cache read that falls back to a background refresh.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    /// The value was cached.
    Ready(T),
    /// The value is absent and a refresh is running for it.
    Pending,
}

/// Result of asking for a refresh.
#[derive(Debug)]
pub enum RefreshTrigger {
    /// This call took the lease and spawned a job.
    Started(FetchHandle),
    /// Another job already holds the lease for the key.
    InProgress,
}

impl RefreshTrigger {
    pub fn started(&self) -> bool {
        matches!(self, RefreshTrigger::Started(_))
    }
}

/// Reads cached values and keeps them fresh.
#[derive(Clone)]
pub struct RefreshService {
    inner: Arc<RefreshInner>,
}

struct RefreshInner {
    cache: DataCache,
    leases: Arc<dyn LeaseManager>,
    source: Arc<dyn RemoteSource>,
    runtime: Handle,
    policy: FetchPolicy,
    /// Status of the most recent job of each key.
    jobs: Mutex<HashMap<String, watch::Receiver<FetchSnapshot>>>,
    /// Keys whose entry failed to decode and already got a refresh for it.
    corrupt: Mutex<HashSet<String>>,
}

impl fmt::Debug for RefreshService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshService")
            .field("cache", &self.inner.cache)
            .field("leases", &self.inner.leases)
            .field("source", &self.inner.source)
            .field("policy", &self.inner.policy)
            .finish()
    }
}

impl RefreshService {
    /// Creates the service. Fetch jobs are spawned onto `runtime`.
    pub fn new(
        cache: DataCache,
        leases: Arc<dyn LeaseManager>,
        source: Arc<dyn RemoteSource>,
        runtime: Handle,
        policy: FetchPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(RefreshInner {
                cache,
                leases,
                source,
                runtime,
                policy,
                jobs: Mutex::new(HashMap::new()),
                corrupt: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn cache(&self) -> &DataCache {
        &self.inner.cache
    }

    pub fn leases(&self) -> &Arc<dyn LeaseManager> {
        &self.inner.leases
    }

    /// Reads the cached value for `key` without triggering anything.
    pub async fn get_cached_value<T: DeserializeOwned>(&self, key: &str) -> CacheContents<Option<T>> {
        self.inner.cache.get(key).await
    }

    /// Reads the cached value for `key`, starting a refresh if it is absent.
    ///
    /// Never waits for the refresh. Store failures do not trigger a refresh.
    ///
    /// An undecodable entry is reported as an error. The first read that finds it starts one
    /// refresh. Later reads only return the error until the entry decodes again or is gone, so a
    /// source serving bad data is not fetched on every read.
    pub async fn get_or_refresh<T: DeserializeOwned>(&self, key: &str) -> CacheContents<Lookup<T>> {
        match self.inner.cache.get(key).await {
            Ok(Some(value)) => {
                self.forget_corrupt(key);
                Ok(Lookup::Ready(value))
            }
            Ok(None) => {
                self.forget_corrupt(key);
                self.request_refresh(key, Trigger::CacheMiss);
                Ok(Lookup::Pending)
            }
            Err(err @ CacheError::CorruptEntry(_)) => {
                let first = self
                    .inner
                    .corrupt
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(key.to_owned());
                if first {
                    tracing::error!(key, error = %err, "cached entry is corrupt, refreshing");
                    self.request_refresh(key, Trigger::CacheMiss);
                } else {
                    tracing::debug!(key, "cached entry is still corrupt");
                }
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    fn forget_corrupt(&self, key: &str) {
        let mut corrupt = self.inner.corrupt.lock().unwrap_or_else(PoisonError::into_inner);
        if corrupt.remove(key) {
            tracing::info!(key, "cached entry decodes again");
        }
    }

    /// Spawns a fetch job for `key` unless one is already in progress.
    pub fn request_refresh(&self, key: &str, trigger: Trigger) -> RefreshTrigger {
        let Some(lease) = LeaseGuard::acquire(Arc::clone(&self.inner.leases), key) else {
            metric!(counter("refresh.trigger") += 1, "trigger" => trigger.as_str(), "started" => "false");
            tracing::debug!(key, %trigger, "refresh already in progress");
            return RefreshTrigger::InProgress;
        };
        metric!(counter("refresh.trigger") += 1, "trigger" => trigger.as_str(), "started" => "true");

        let job = FetchJob::new(
            key,
            trigger,
            self.inner.policy,
            Arc::clone(&self.inner.source),
            self.inner.cache.clone(),
        );
        let status = job.subscribe();
        self.inner
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned(), status.clone());

        let span = tracing::info_span!(
            "fetch_job",
            key,
            trigger = trigger.as_str(),
            holder = %lease.holder(),
        );
        let task = job
            .run(lease)
            .instrument(span)
            .bind_hub(Hub::new_from_top(Hub::current()));
        let handle = self.inner.runtime.spawn(task);

        tracing::debug!(key, %trigger, "spawned refresh");
        RefreshTrigger::Started(FetchHandle::new(status, handle))
    }

    /// The latest status of the most recent fetch job for `key`.
    pub fn fetch_status(&self, key: &str) -> Option<FetchSnapshot> {
        let jobs = self.inner.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        jobs.get(key).map(|status| status.borrow().clone())
    }

    /// Drops refresh leases past their TTL.
    pub fn reclaim_expired_leases(&self) -> Vec<String> {
        self.inner.leases.reclaim_expired()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::caching::InMemoryStore;
    use crate::test::{self, ScriptedSource};

    fn service(source: Arc<ScriptedSource>) -> RefreshService {
        RefreshService::new(
            DataCache::new(Arc::new(InMemoryStore::new(1024 * 1024))),
            Arc::new(InMemoryLeases::new(None)),
            source,
            Handle::current(),
            FetchPolicy {
                ttl: Duration::from_secs(3600),
                max_attempts: 3,
                backoff: Backoff::fixed(Duration::from_secs(60)),
            },
        )
    }

    #[tokio::test]
    async fn concurrent_triggers_start_one_job() {
        test::setup();
        let source = Arc::new(ScriptedSource::succeeding("[]").with_delay(Duration::from_millis(50)));
        let refresh = service(source.clone());

        let mut started = vec![];
        for _ in 0..10 {
            if let RefreshTrigger::Started(handle) = refresh.request_refresh("dataset", Trigger::CacheMiss) {
                started.push(handle);
            }
        }
        assert_eq!(started.len(), 1);

        let outcome = started.pop().unwrap().wait().await.unwrap();
        assert!(outcome.succeeded());
        assert_eq!(source.calls(), 1);

        // the lease is free again once the job is done
        assert!(refresh.request_refresh("dataset", Trigger::Manual).started());
    }

    async fn wait_for_job(refresh: &RefreshService, key: &str) -> FetchSnapshot {
        let mut status = refresh.inner.jobs.lock().unwrap().get(key).unwrap().clone();
        status.wait_for(|s| s.state.is_terminal()).await.unwrap().clone()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_misses_fetch_once() {
        test::setup();
        let source = Arc::new(ScriptedSource::succeeding("[]").with_delay(Duration::from_secs(1)));
        let refresh = service(source.clone());

        let readers: Vec<_> = (0..16)
            .map(|_| {
                let refresh = refresh.clone();
                tokio::spawn(async move {
                    refresh
                        .get_or_refresh::<serde_json::Value>("dataset")
                        .await
                })
            })
            .collect();
        for reader in futures::future::join_all(readers).await {
            assert_eq!(reader.unwrap(), Ok(Lookup::Pending));
        }

        // give the job time to start its slow fetch
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(source.calls(), 1);
        assert!(refresh.leases().holder("dataset").is_some());
        assert!(!refresh.fetch_status("dataset").unwrap().state.is_terminal());

        let snapshot = wait_for_job(&refresh, "dataset").await;
        assert_eq!(snapshot.state, FetchState::Succeeded);
        assert_eq!(source.calls(), 1);
        assert_eq!(
            refresh.get_or_refresh::<serde_json::Value>("dataset").await,
            Ok(Lookup::Ready(serde_json::json!([])))
        );
    }

    #[tokio::test]
    async fn corrupt_entries_are_refreshed_once() {
        test::setup();
        // valid JSON, but not the list the reader expects
        let source = Arc::new(ScriptedSource::succeeding(r#"{"value": 1}"#));
        let refresh = service(source.clone());

        let first = refresh.get_or_refresh::<Vec<serde_json::Value>>("dataset").await;
        assert_eq!(first, Ok(Lookup::Pending));
        wait_for_job(&refresh, "dataset").await;
        assert_eq!(source.calls(), 1);

        let second = refresh.get_or_refresh::<Vec<serde_json::Value>>("dataset").await;
        assert!(matches!(second, Err(CacheError::CorruptEntry(_))));
        wait_for_job(&refresh, "dataset").await;
        assert_eq!(source.calls(), 2);

        for _ in 0..3 {
            let again = refresh.get_or_refresh::<Vec<serde_json::Value>>("dataset").await;
            assert!(matches!(again, Err(CacheError::CorruptEntry(_))));
        }
        assert!(refresh.leases().holder("dataset").is_none());
        assert_eq!(source.calls(), 2);

        // once the entry decodes, corruption is detected and healed again
        let decoded = refresh.get_or_refresh::<serde_json::Value>("dataset").await;
        assert_eq!(decoded, Ok(Lookup::Ready(serde_json::json!({"value": 1}))));
        let third = refresh.get_or_refresh::<Vec<serde_json::Value>>("dataset").await;
        assert!(matches!(third, Err(CacheError::CorruptEntry(_))));
        wait_for_job(&refresh, "dataset").await;
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test]
    async fn miss_returns_pending_without_waiting() {
        test::setup();
        let source = Arc::new(ScriptedSource::succeeding(r#"[{"value": 4}]"#));
        let refresh = service(source.clone());

        let first = refresh.get_or_refresh::<serde_json::Value>("dataset").await;
        assert_eq!(first, Ok(Lookup::Pending));

        let status = refresh.fetch_status("dataset").unwrap();
        assert_eq!(status.trigger, Trigger::CacheMiss);

        let mut jobs = refresh.inner.jobs.lock().unwrap().get("dataset").unwrap().clone();
        jobs.wait_for(|s| s.state.is_terminal()).await.unwrap();

        let second = refresh.get_or_refresh::<serde_json::Value>("dataset").await;
        assert_eq!(second, Ok(Lookup::Ready(serde_json::json!([{"value": 4}]))));
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn pending_retry_keeps_the_lease() {
        test::setup();
        tokio::time::pause();

        let source = Arc::new(ScriptedSource::new([
            Err(FetchError::TransportFailure("boom".into())),
            Ok("[]"),
        ]));
        let refresh = service(source.clone());

        let RefreshTrigger::Started(handle) = refresh.request_refresh("dataset", Trigger::Scheduled)
        else {
            panic!("first trigger must start a job");
        };

        let mut status = refresh.inner.jobs.lock().unwrap().get("dataset").unwrap().clone();
        status.wait_for(|s| s.state == FetchState::Retrying).await.unwrap();

        assert!(!refresh.request_refresh("dataset", Trigger::CacheMiss).started());

        let outcome = handle.wait().await.unwrap();
        assert_eq!(outcome.state, FetchState::Succeeded);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(source.calls(), 2);
    }
}
