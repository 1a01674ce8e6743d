use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use metricator_service::refresh::Lookup;
use metricator_service::services::SharedServices;
use serde_json::Value;

use super::ResponseError;

/// Serves the cached dataset. A miss starts a background refresh and answers `503` right away.
pub async fn get_data(State(services): State<SharedServices>) -> Result<Json<Value>, ResponseError> {
    let key = &services.config.cache.dataset_key;
    match services.refresh.get_or_refresh::<Value>(key).await? {
        Lookup::Ready(data) => Ok(Json(data)),
        Lookup::Pending => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            "data not available, fetching in background",
        )
            .into()),
    }
}
