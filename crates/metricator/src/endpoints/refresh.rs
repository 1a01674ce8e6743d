use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use metricator_service::refresh::{RefreshTrigger, Trigger};
use metricator_service::services::SharedServices;
use serde::Serialize;

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshStatus {
    Started,
    InProgress,
}

#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    status: RefreshStatus,
}

/// Starts a refresh of the dataset unless one is already running. Never waits for the fetch.
pub async fn trigger_refresh(
    State(services): State<SharedServices>,
) -> (StatusCode, Json<RefreshResponse>) {
    let key = &services.config.cache.dataset_key;
    match services.refresh.request_refresh(key, Trigger::Manual) {
        RefreshTrigger::Started(_) => (
            StatusCode::ACCEPTED,
            Json(RefreshResponse {
                status: RefreshStatus::Started,
            }),
        ),
        RefreshTrigger::InProgress => (
            StatusCode::OK,
            Json(RefreshResponse {
                status: RefreshStatus::InProgress,
            }),
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::test;

    fn request() -> Request<Body> {
        Request::post("/refresh").body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_refresh_is_single_flight() {
        test::setup();
        let server = test::DataServer::new("[]");
        server.set_delay(Duration::from_secs(5));
        let (app, _services) = test::app(Some(&server));

        let response = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(test::body_json(response).await, json!({"status": "started"}));

        let response = app.oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(test::body_json(response).await, json!({"status": "in_progress"}));
    }
}
