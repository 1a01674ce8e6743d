use std::time::Duration;

use metricator_service::config::Config;
use metricator_service::refresh::{Backoff, FetchSnapshot, RefreshService};
use metricator_service::services::SharedServices;
use metricator_test as test;

pub use test::DataServer;

/// Setup tests and create the services, fetching from `server`.
///
/// Entries are stored in a temporary cache directory, which is cleaned up when the returned
/// [`TempDir`](test::TempDir) is dropped. Keep it as guard until the test has finished.
///
/// Failed fetches are retried quickly. The `update_config` closure can modify any default
/// configuration before the services are created.
pub fn setup_services(
    server: &DataServer,
    update_config: impl FnOnce(&mut Config),
) -> (SharedServices, test::TempDir) {
    test::setup();

    let cache_dir = test::tempdir();

    let mut config = Config {
        cache_dir: Some(cache_dir.path().to_owned()),
        ..Default::default()
    };
    config.source.url = Some(server.url());
    config.source.timeout = Duration::from_secs(5);
    config.refresh.backoff = Backoff::fixed(Duration::from_millis(10));
    update_config(&mut config);

    let handle = tokio::runtime::Handle::current();
    let services = SharedServices::new(config, handle.clone(), handle).unwrap();

    (services, cache_dir)
}

/// Polls the status of the latest fetch job for `key` until it is terminal.
pub async fn wait_for_fetch(refresh: &RefreshService, key: &str) -> FetchSnapshot {
    for _ in 0..200 {
        if let Some(status) = refresh.fetch_status(key) {
            if status.state.is_terminal() {
                return status;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("fetch job for `{key}` did not finish");
}
