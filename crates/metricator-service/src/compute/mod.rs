//! Metric computations over a [`Dataset`] snapshot.
//!
//! Metrics are looked up by name in a [`MetricRegistry`]. The built-in metrics are:
//!
//! - `total_count`: the number of records.
//! - `avg_value`: the mean of the records' `value`.
//! - `sum_value`: the sum of the records' `value`.
//! - `min_value` / `max_value`: the smallest and largest `value`.
//!
//! The mean and the extremes are undefined for an empty dataset.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod dataset;

pub use dataset::{Dataset, VALUE_FIELD};

/// The value of a computed metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Count(u64),
    Number(f64),
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Count(count) => count.fmt(f),
            MetricValue::Number(number) => number.fmt(f),
        }
    }
}

/// Why a single metric could not be computed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ComputeError {
    #[error("unknown metric: {0}")]
    UnknownMetric(String),
    #[error("not enough data to compute {0}")]
    InsufficientData(String),
    #[error("dataset not available")]
    DataUnavailable,
    /// The job stopped without reporting a result.
    #[error("metric computation aborted")]
    Aborted,
}

impl ComputeError {
    /// A short, stable name used in error payloads and metric tags.
    pub fn kind(&self) -> &'static str {
        match self {
            ComputeError::UnknownMetric(_) => "unknown_metric",
            ComputeError::InsufficientData(_) => "insufficient_data",
            ComputeError::DataUnavailable => "data_unavailable",
            ComputeError::Aborted => "aborted",
        }
    }
}

/// A metric implementation.
pub type MetricFn = dyn Fn(&Dataset) -> Result<MetricValue, ComputeError> + Send + Sync;

/// Maps metric names to their implementations.
#[derive(Clone, Default)]
pub struct MetricRegistry {
    metrics: HashMap<String, Arc<MetricFn>>,
}

impl fmt::Debug for MetricRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.names()).finish()
    }
}

impl MetricRegistry {
    /// A registry without any metrics.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A registry with all built-in metrics.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("total_count", |data| Ok(MetricValue::Count(data.len() as u64)));
        registry.register("avg_value", |data| {
            if data.is_empty() {
                return Err(ComputeError::InsufficientData("avg_value".into()));
            }
            let sum: f64 = data.values(VALUE_FIELD).sum();
            Ok(MetricValue::Number(sum / data.len() as f64))
        });
        registry.register("sum_value", |data| {
            Ok(MetricValue::Number(data.values(VALUE_FIELD).sum()))
        });
        registry.register("min_value", |data| {
            data.values(VALUE_FIELD)
                .reduce(f64::min)
                .map(MetricValue::Number)
                .ok_or_else(|| ComputeError::InsufficientData("min_value".into()))
        });
        registry.register("max_value", |data| {
            data.values(VALUE_FIELD)
                .reduce(f64::max)
                .map(MetricValue::Number)
                .ok_or_else(|| ComputeError::InsufficientData("max_value".into()))
        });
        registry
    }

    /// Adds or replaces the metric called `name`.
    pub fn register<F>(&mut self, name: &str, metric: F)
    where
        F: Fn(&Dataset) -> Result<MetricValue, ComputeError> + Send + Sync + 'static,
    {
        self.metrics.insert(name.to_owned(), Arc::new(metric));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.metrics.contains_key(name)
    }

    /// All registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.metrics.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Computes the metric called `name` over `dataset`.
    pub fn compute(&self, name: &str, dataset: &Dataset) -> Result<MetricValue, ComputeError> {
        let metric = self
            .metrics
            .get(name)
            .ok_or_else(|| ComputeError::UnknownMetric(name.to_owned()))?;
        metric(dataset)
    }
}
