use std::time::Duration;

use metricator_service::refresh::{FetchError, FetchState, Lookup, RefreshTrigger, Trigger};
use serde_json::{Value, json};

use crate::{DataServer, setup_services, wait_for_fetch};

#[tokio::test]
async fn test_miss_then_hit() {
    let server = DataServer::new(r#"[{"value": 1}, {"value": 2}]"#);
    let (services, _cache_dir) = setup_services(&server, |_| {});

    let lookup = services.refresh.get_or_refresh::<Value>("dataset").await;
    assert_eq!(lookup, Ok(Lookup::Pending));

    let status = wait_for_fetch(&services.refresh, "dataset").await;
    assert_eq!(status.state, FetchState::Succeeded);
    assert_eq!(status.attempt, 1);

    let lookup = services.refresh.get_or_refresh::<Value>("dataset").await;
    assert_eq!(
        lookup,
        Ok(Lookup::Ready(json!([{"value": 1}, {"value": 2}])))
    );
    assert_eq!(server.hits(), 1);
}

#[tokio::test]
async fn test_retries_until_the_server_recovers() {
    let server = DataServer::new("[]");
    server.fail_next(2);
    let (services, _cache_dir) = setup_services(&server, |config| {
        config.refresh.max_attempts = 3;
    });

    let RefreshTrigger::Started(job) = services.refresh.request_refresh("dataset", Trigger::Manual)
    else {
        panic!("no refresh should be running");
    };
    let outcome = job.wait().await.unwrap();

    assert!(outcome.succeeded());
    assert_eq!(outcome.attempts, 3);
    assert!(matches!(outcome.error, Some(FetchError::TransportFailure(_))));
    assert_eq!(server.hits(), 3);
    assert_eq!(
        services.refresh.get_cached_value::<Value>("dataset").await,
        Ok(Some(json!([])))
    );
}

#[tokio::test]
async fn test_gives_up_without_writing() {
    let server = DataServer::new("[]");
    server.fail_next(10);
    let (services, _cache_dir) = setup_services(&server, |config| {
        config.refresh.max_attempts = 2;
    });

    let RefreshTrigger::Started(job) = services.refresh.request_refresh("dataset", Trigger::Manual)
    else {
        panic!("no refresh should be running");
    };
    let outcome = job.wait().await.unwrap();

    assert_eq!(outcome.state, FetchState::Failed);
    assert_eq!(outcome.attempts, 2);
    assert_eq!(server.hits(), 2);
    assert_eq!(services.cache.get_raw("dataset").await, Ok(None));

    // the lease was released, a new refresh can start
    assert!(
        services
            .refresh
            .request_refresh("dataset", Trigger::Manual)
            .started()
    );
}

#[tokio::test]
async fn test_cached_entries_survive_restarts() {
    let server = DataServer::new(r#"[{"value": 3}]"#);
    let (services, cache_dir) = setup_services(&server, |_| {});

    services.warm_up().await;
    let status = wait_for_fetch(&services.refresh, "dataset").await;
    assert_eq!(status.state, FetchState::Succeeded);
    drop(services);

    let handle = tokio::runtime::Handle::current();
    let mut config = metricator_service::config::Config {
        cache_dir: Some(cache_dir.path().to_owned()),
        ..Default::default()
    };
    config.source.url = Some(server.url());
    let restarted =
        metricator_service::services::SharedServices::new(config, handle.clone(), handle).unwrap();

    assert_eq!(restarted.warm_up().await, 0);
    assert_eq!(
        restarted.refresh.get_cached_value::<Value>("dataset").await,
        Ok(Some(json!([{"value": 3}])))
    );
    assert_eq!(server.hits(), 1);
}

#[tokio::test]
async fn test_scheduler_refreshes_tracked_keys() {
    let server = DataServer::new(r#"[{"value": 1}]"#);
    let (services, _cache_dir) = setup_services(&server, |config| {
        config.refresh.interval = Duration::from_millis(100);
        config.refresh.refresh_on_startup = true;
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let scheduler = tokio::spawn(services.scheduler().run(shutdown_rx));

    wait_for_fetch(&services.refresh, "dataset").await;
    server.set_payload(r#"[{"value": 5}]"#);

    let mut refreshed = false;
    for _ in 0..100 {
        let cached = services.refresh.get_cached_value::<Value>("dataset").await;
        if cached == Ok(Some(json!([{"value": 5}]))) {
            refreshed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(refreshed, "the scheduler never picked up the new payload");
    assert!(server.hits() >= 2);

    shutdown_tx.send(true).unwrap();
    scheduler.await.unwrap();
}
