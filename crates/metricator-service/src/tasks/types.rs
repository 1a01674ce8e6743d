use std::collections::HashSet;
use std::fmt;

use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use uuid::Uuid;

use crate::caching::CacheError;
use crate::compute::{ComputeError, MetricValue};

/// Identifies a group of metric jobs dispatched by one request.
#[derive(Debug, Clone, Copy, Serialize, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct GroupId(Uuid);

impl GroupId {
    pub fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl<'de> Deserialize<'de> for GroupId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // malformed ids become the nil id, which is never handed out and so is simply not found
        let uuid = Uuid::deserialize(deserializer);
        Ok(Self(uuid.unwrap_or_default()))
    }
}

/// State of a single metric job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

/// The outcome of one requested metric.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricResult {
    pub name: String,
    pub outcome: Result<MetricValue, ComputeError>,
}

/// The aggregate status of a task group.
///
/// Serializes as `{"status": "pending"}`, or once every job is done as
/// `{"status": "success", "results": {name: value}, "errors": {name: {"kind", "message"}}}`,
/// with names in request order.
#[derive(Debug, Clone, PartialEq)]
pub enum GroupStatus {
    /// At least one job has not finished yet.
    Pending,
    /// Every job finished. Results are in request order, one per requested name.
    Completed(Vec<MetricResult>),
}

impl GroupStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, GroupStatus::Pending)
    }
}

impl Serialize for GroupStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            GroupStatus::Pending => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("status", "pending")?;
                map.end()
            }
            GroupStatus::Completed(results) => {
                let mut map = serializer.serialize_map(Some(3))?;
                map.serialize_entry("status", "success")?;
                map.serialize_entry("results", &Values(results))?;
                map.serialize_entry("errors", &Errors(results))?;
                map.end()
            }
        }
    }
}

/// Successful results keyed by name. A name requested twice is listed once.
struct Values<'a>(&'a [MetricResult]);

impl Serialize for Values<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seen = HashSet::new();
        let mut map = serializer.serialize_map(None)?;
        for result in self.0 {
            if let Ok(value) = &result.outcome {
                if seen.insert(result.name.as_str()) {
                    map.serialize_entry(&result.name, value)?;
                }
            }
        }
        map.end()
    }
}

#[derive(Serialize)]
struct ErrorDetail {
    kind: &'static str,
    message: String,
}

/// Failed results keyed by name.
struct Errors<'a>(&'a [MetricResult]);

impl Serialize for Errors<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seen = HashSet::new();
        let mut map = serializer.serialize_map(None)?;
        for result in self.0 {
            if let Err(err) = &result.outcome {
                if seen.insert(result.name.as_str()) {
                    let detail = ErrorDetail {
                        kind: err.kind(),
                        message: err.to_string(),
                    };
                    map.serialize_entry(&result.name, &detail)?;
                }
            }
        }
        map.end()
    }
}

/// Why a metrics request was rejected. No jobs were created.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("invalid request: {0}")]
    InvalidArgument(String),
    /// The dataset is not cached yet. A refresh has been started.
    #[error("data not available, fetching in background")]
    DataUnavailable,
    #[error("failed to read the dataset")]
    Store(#[from] CacheError),
    #[error("maximum number of concurrent task groups reached")]
    TooManyRequests,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatusError {
    /// The group never existed, or was evicted after its poll window.
    #[error("task group {0} not found")]
    NotFound(GroupId),
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn pending_serialization() {
        assert_eq!(
            serde_json::to_value(GroupStatus::Pending).unwrap(),
            json!({"status": "pending"})
        );
    }

    #[test]
    fn completed_serialization_keeps_request_order() {
        let status = GroupStatus::Completed(vec![
            MetricResult {
                name: "total_count".into(),
                outcome: Ok(MetricValue::Count(2)),
            },
            MetricResult {
                name: "bogus_metric".into(),
                outcome: Err(ComputeError::UnknownMetric("bogus_metric".into())),
            },
            MetricResult {
                name: "avg_value".into(),
                outcome: Ok(MetricValue::Number(3.0)),
            },
            MetricResult {
                name: "total_count".into(),
                outcome: Ok(MetricValue::Count(2)),
            },
        ]);

        let serialized = serde_json::to_string(&status).unwrap();
        assert_eq!(
            serialized,
            r#"{"status":"success","results":{"total_count":2,"avg_value":3.0},"errors":{"bogus_metric":{"kind":"unknown_metric","message":"unknown metric: bogus_metric"}}}"#
        );
    }

    #[test]
    fn malformed_group_ids_are_nil() {
        let id: GroupId = serde_json::from_value(json!("not-a-uuid")).unwrap();
        assert_eq!(id, GroupId::new(Uuid::nil()));
    }
}
