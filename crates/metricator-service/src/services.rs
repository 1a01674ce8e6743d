//! Provides the internal Metricator services and a way to initialize them.
//!
//! [`SharedServices`] creates the cache store, the refresh machinery and the task coordinator
//! according to the provided [`Config`].
//!
//! Fetch jobs run on a runtime dedicated to I/O, metric jobs on a separate cpu runtime.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::future::BoxFuture;

use crate::caching::DataCache;
use crate::compute::MetricRegistry;
use crate::config::Config;
use crate::refresh::{
    FetchError, FetchPolicy, HttpSource, InMemoryLeases, RefreshService, RemoteSource, Scheduler,
    Trigger,
};
use crate::tasks::{TaskCoordinator, record_task_metrics};

/// The source used when no remote URL is configured. Every fetch fails.
#[derive(Debug)]
struct UnconfiguredSource;

impl RemoteSource for UnconfiguredSource {
    fn fetch<'a>(&'a self, _key: &'a str) -> BoxFuture<'a, Result<Bytes, FetchError>> {
        Box::pin(async {
            Err(FetchError::TransportFailure(
                "no source url configured".into(),
            ))
        })
    }
}

#[derive(Clone, Debug)]
pub struct SharedServices {
    pub config: Arc<Config>,
    pub cache: DataCache,
    pub refresh: RefreshService,
    pub coordinator: TaskCoordinator,
}

impl SharedServices {
    pub fn new(
        config: Config,
        io_pool: tokio::runtime::Handle,
        cpu_pool: tokio::runtime::Handle,
    ) -> Result<Self> {
        let cache = DataCache::from_config(&config).context("failed to create cache store")?;

        let source: Arc<dyn RemoteSource> = match HttpSource::from_config(&config.source)
            .context("failed to create remote source")?
        {
            Some(source) => {
                tracing::info!(endpoint = %source.endpoint(), "using remote source");
                Arc::new(source)
            }
            None => {
                tracing::warn!("no source url configured, refreshes will fail");
                Arc::new(UnconfiguredSource)
            }
        };

        let leases = Arc::new(InMemoryLeases::new(Some(config.lease_ttl())));
        let policy = FetchPolicy {
            ttl: config.cache.ttl,
            max_attempts: config.refresh.max_attempts,
            backoff: config.refresh.backoff,
        };
        let refresh = RefreshService::new(cache.clone(), leases, source, io_pool.clone(), policy);

        let coordinator = TaskCoordinator::new(
            refresh.clone(),
            MetricRegistry::builtin(),
            config.cache.dataset_key.clone(),
            cpu_pool,
            &config.tasks,
        );

        {
            let taskmon = coordinator.task_monitor().clone();
            io_pool.spawn(async move {
                for interval in taskmon.intervals() {
                    record_task_metrics("metrics", &interval);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            });
        }

        Ok(Self {
            config: Arc::new(config),
            cache,
            refresh,
            coordinator,
        })
    }

    /// The scheduler for the configured tracked keys.
    pub fn scheduler(&self) -> Scheduler {
        let refresh = &self.config.refresh;
        Scheduler::new(
            self.refresh.clone(),
            refresh.tracked_keys.clone(),
            refresh.interval,
        )
        .immediate(refresh.refresh_on_startup)
    }

    /// Starts a refresh for every tracked key that is not cached yet.
    ///
    /// Returns how many refreshes were started.
    pub async fn warm_up(&self) -> usize {
        let mut started = 0;
        for key in &self.config.refresh.tracked_keys {
            match self.cache.get_raw(key).await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(err) => {
                    let error = &err as &dyn std::error::Error;
                    tracing::warn!(key, error, "failed to check cached key");
                }
            }
            if self.refresh.request_refresh(key, Trigger::Startup).started() {
                started += 1;
            }
        }
        started
    }
}

#[cfg(test)]
mod tests {
    use tokio::runtime::Handle;

    use super::*;
    use crate::test;

    #[tokio::test]
    async fn warm_up_without_source_fails_gracefully() {
        test::setup();
        let mut config = Config {
            cache_dir: None,
            ..Default::default()
        };
        config.refresh.max_attempts = 1;
        let services = SharedServices::new(config, Handle::current(), Handle::current()).unwrap();

        assert_eq!(services.warm_up().await, 1);

        let mut outcome = None;
        for _ in 0..100 {
            let status = services.refresh.fetch_status("dataset").unwrap();
            if status.state.is_terminal() {
                outcome = Some(status);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let status = outcome.expect("fetch job never finished");
        assert_eq!(
            status.last_error,
            Some(FetchError::TransportFailure("no source url configured".into()))
        );
    }

    #[tokio::test]
    async fn warm_up_skips_cached_keys() {
        test::setup();
        let cache_dir = test::tempdir();
        let config = Config {
            cache_dir: Some(cache_dir.path().to_owned()),
            ..Default::default()
        };
        let services = SharedServices::new(config, Handle::current(), Handle::current()).unwrap();
        assert_eq!(services.cache.store_name(), "filesystem");

        services
            .cache
            .set("dataset", &serde_json::json!([]), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(services.warm_up().await, 0);
        assert!(services.refresh.fetch_status("dataset").is_none());
    }
}
