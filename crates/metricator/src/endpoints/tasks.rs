use std::time::Duration;

use axum::Json;
use axum::extract::{Path, Query, State};
use metricator_service::services::SharedServices;
use metricator_service::tasks::{GroupId, GroupStatus};
use serde::{Deserialize, Serialize};

use super::ResponseError;

/// JSON body of the metrics request.
#[derive(Debug, Deserialize)]
pub struct MetricsRequestBody {
    #[serde(default)]
    pub metrics: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct TaskCreated {
    task_id: GroupId,
}

/// Dispatches one job per requested metric and answers with the id to poll.
pub async fn create_task(
    State(services): State<SharedServices>,
    Json(body): Json<MetricsRequestBody>,
) -> Result<Json<TaskCreated>, ResponseError> {
    let task_id = services.coordinator.dispatch(body.metrics).await?;
    Ok(Json(TaskCreated { task_id }))
}

/// Query parameters of the task poll request.
#[derive(Debug, Deserialize)]
pub struct PollTaskQueryParams {
    /// Seconds to wait for the group to complete.
    #[serde(default)]
    pub timeout: Option<u64>,
}

pub async fn poll_task(
    State(services): State<SharedServices>,
    Path(group_id): Path<GroupId>,
    Query(params): Query<PollTaskQueryParams>,
) -> Result<Json<GroupStatus>, ResponseError> {
    let coordinator = &services.coordinator;
    let status = match params.timeout {
        Some(timeout) => {
            coordinator
                .wait_for_status(group_id, Duration::from_secs(timeout))
                .await?
        }
        None => coordinator.status(group_id)?,
    };
    Ok(Json(status))
}
