use std::time::Duration;

use metricator_service::compute::{ComputeError, MetricValue};
use metricator_service::tasks::{DispatchError, GroupStatus, JobState};

use crate::{DataServer, setup_services, wait_for_fetch};

#[tokio::test]
async fn test_dispatch_after_refresh() {
    let server = DataServer::new(r#"[{"value": 2}, {"value": 4}, {"name": "no value"}]"#);
    let (services, _cache_dir) = setup_services(&server, |_| {});
    let names = || vec!["total_count".to_owned(), "max_value".to_owned()];

    assert_eq!(
        services.coordinator.dispatch(names()).await,
        Err(DispatchError::DataUnavailable)
    );
    wait_for_fetch(&services.refresh, "dataset").await;

    let group_id = services.coordinator.dispatch(names()).await.unwrap();
    let status = services
        .coordinator
        .wait_for_status(group_id, Duration::from_secs(5))
        .await
        .unwrap();

    let GroupStatus::Completed(results) = status else {
        panic!("group did not complete");
    };
    let outcomes: Vec<_> = results.into_iter().map(|r| (r.name, r.outcome)).collect();
    assert_eq!(
        outcomes,
        vec![
            ("total_count".to_owned(), Ok(MetricValue::Count(3))),
            ("max_value".to_owned(), Ok(MetricValue::Number(4.0))),
        ]
    );
    assert_eq!(
        services.coordinator.job_states(group_id).unwrap(),
        vec![
            ("total_count".to_owned(), JobState::Succeeded),
            ("max_value".to_owned(), JobState::Succeeded),
        ]
    );
}

#[tokio::test]
async fn test_empty_dataset_metrics() {
    let server = DataServer::new("[]");
    let (services, _cache_dir) = setup_services(&server, |_| {});
    services.warm_up().await;
    wait_for_fetch(&services.refresh, "dataset").await;

    let group_id = services
        .coordinator
        .dispatch(vec!["avg_value".to_owned(), "sum_value".to_owned()])
        .await
        .unwrap();
    let status = services
        .coordinator
        .wait_for_status(group_id, Duration::from_secs(5))
        .await
        .unwrap();

    let GroupStatus::Completed(results) = status else {
        panic!("group did not complete");
    };
    assert_eq!(
        results[0].outcome,
        Err(ComputeError::InsufficientData("avg_value".into()))
    );
    assert_eq!(results[1].outcome, Ok(MetricValue::Number(0.0)));
}
