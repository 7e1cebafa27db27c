//! Core data models for the metrics adapter

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identity of an autoscaler resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceReference {
    pub name: String,
    pub namespace: String,
}

impl ResourceReference {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

impl fmt::Display for ResourceReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Source type of an autoscaler metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MetricSourceType {
    Object,
    Pods,
    External,
}

impl MetricSourceType {
    /// Lowercase form used in metric-config annotations
    pub fn annotation_name(&self) -> &'static str {
        match self {
            MetricSourceType::Object => "object",
            MetricSourceType::Pods => "pods",
            MetricSourceType::External => "external",
        }
    }
}

impl fmt::Display for MetricSourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricSourceType::Object => write!(f, "Object"),
            MetricSourceType::Pods => write!(f, "Pods"),
            MetricSourceType::External => write!(f, "External"),
        }
    }
}

/// Distinguishes one kind of metric within a single autoscaler
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MetricTypeName {
    pub source_type: MetricSourceType,
    pub metric_name: String,
}

impl MetricTypeName {
    pub fn new(source_type: MetricSourceType, metric_name: impl Into<String>) -> Self {
        Self {
            source_type,
            metric_name: metric_name.into(),
        }
    }
}

impl fmt::Display for MetricTypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source_type, self.metric_name)
    }
}

/// Kubernetes group/resource pair, e.g. `deployments.apps`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupResource {
    pub group: String,
    pub resource: String,
}

impl GroupResource {
    pub fn new(group: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            resource: resource.into(),
        }
    }

    /// Derive the group resource of a described object from its
    /// `apiVersion` and `kind`
    pub fn for_object(object: &ObjectReference) -> Self {
        let group = match object.api_version.split_once('/') {
            Some((group, _version)) => group.to_string(),
            None => String::new(),
        };

        Self {
            group,
            resource: pluralize(&object.kind.to_lowercase()),
        }
    }
}

impl fmt::Display for GroupResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.resource)
        } else {
            write!(f, "{}.{}", self.resource, self.group)
        }
    }
}

fn pluralize(kind: &str) -> String {
    if kind.ends_with('s') || kind.ends_with('x') || kind.ends_with("ch") || kind.ends_with("sh") {
        format!("{kind}es")
    } else if let Some(stem) = kind.strip_suffix('y') {
        if stem.ends_with(&['a', 'e', 'i', 'o', 'u'][..]) {
            format!("{kind}s")
        } else {
            format!("{stem}ies")
        }
    } else {
        format!("{kind}s")
    }
}

/// Reference to the object a custom metric describes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectReference {
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

/// A custom metric value describing a single object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomMetricValue {
    pub metric_name: String,
    pub value: f64,
    pub described_object: ObjectReference,
    /// Labels of the described object, used for selector queries
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

/// An external metric value identified by its label set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalMetricValue {
    pub metric_name: String,
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// A single value produced by a collector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CollectedMetric {
    Custom(CustomMetricValue),
    External(ExternalMetricValue),
}

impl CollectedMetric {
    pub fn metric_name(&self) -> &str {
        match self {
            CollectedMetric::Custom(v) => &v.metric_name,
            CollectedMetric::External(v) => &v.metric_name,
        }
    }
}

/// A batch of values sent from a collector runner to the aggregation loop
#[derive(Debug, Default)]
pub struct MetricCollection {
    pub values: Vec<CollectedMetric>,
    pub error: Option<anyhow::Error>,
}

/// Custom metric advertised for discovery
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CustomMetricInfo {
    pub group_resource: GroupResource,
    pub metric: String,
    pub namespaced: bool,
}

/// External metric advertised for discovery
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExternalMetricInfo {
    pub metric: String,
}

/// Render a label set as `k1=v1,k2=v2`
pub fn format_labels(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}
