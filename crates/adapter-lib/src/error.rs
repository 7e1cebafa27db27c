//! Typed errors surfaced by the adapter engine

use crate::models::{GroupResource, MetricSourceType, MetricTypeName};
use thiserror::Error;

/// A point lookup found no stored value. This is a normal negative
/// result, not a failure of the adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("the server could not find the metric {metric_name} for {group_resource} {name}")]
pub struct MetricNotFound {
    pub group_resource: GroupResource,
    pub metric_name: String,
    pub name: String,
}

/// Errors deriving collection jobs from an autoscaler definition
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("unknown metric source type '{0}'")]
    UnknownMetricType(String),

    #[error("metric of type {0} is missing its source definition")]
    MissingMetricSource(MetricSourceType),

    #[error("invalid interval '{value}' in annotation {annotation}")]
    InvalidInterval { annotation: String, value: String },

    #[error("autoscaler has no spec")]
    MissingSpec,
}

/// Errors instantiating a collector for a job
#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("no collector plugin registered for {metric_type_name} (collector '{collector_name}')")]
    NoPlugin {
        metric_type_name: MetricTypeName,
        collector_name: String,
    },

    #[error("failed to create collector for {metric_type_name}: {source}")]
    Plugin {
        metric_type_name: MetricTypeName,
        #[source]
        source: anyhow::Error,
    },
}
