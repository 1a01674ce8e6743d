use axum::Router;
use axum::routing::{get, post};
use metricator_service::services::SharedServices;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use tower::ServiceBuilder;

mod data;
mod error;
mod metrics;
mod refresh;
mod tasks;

pub use error::ResponseError;
use metrics::MetricsLayer;

use data::get_data;
use refresh::trigger_refresh;
use tasks::{create_task, poll_task};

pub async fn healthcheck() -> &'static str {
    metricator_service::metric!(counter("healthcheck") += 1);
    "ok"
}

pub fn create_app(services: SharedServices) -> Router {
    // The layers here go "top to bottom" according to the reading order here.
    let layer = ServiceBuilder::new()
        .layer(NewSentryLayer::new_from_top())
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(MetricsLayer);
    Router::new()
        .route("/data", get(get_data))
        .route("/metrics", post(create_task))
        .route("/task/:group_id", get(poll_task))
        .route("/refresh", post(trigger_refresh))
        .with_state(services)
        .layer(layer)
        // the healthcheck is last, as it will bypass all the middlewares
        .route("/healthcheck", get(healthcheck))
}
