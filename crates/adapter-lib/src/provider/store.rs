//! Expiring metric store
//!
//! Holds the most recent value of every collected metric and answers point
//! and label-selector queries. Entries that have not been refreshed within
//! the TTL are dropped by [`MetricStore::remove_expired`].

use crate::labels::Selector;
use crate::models::{
    CollectedMetric, CustomMetricInfo, CustomMetricValue, ExternalMetricInfo,
    ExternalMetricValue, GroupResource,
};
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tokio::time::Instant;

/// Default time after which an entry that was not updated is evicted
pub const DEFAULT_METRIC_TTL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CustomKey {
    group_resource: GroupResource,
    metric_name: String,
    namespace: String,
    name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ExternalKey {
    metric_name: String,
    namespace: String,
    labels: BTreeMap<String, String>,
}

#[derive(Debug)]
struct StoredMetric<T> {
    value: T,
    updated_at: Instant,
}

impl<T> StoredMetric<T> {
    fn new(value: T) -> Self {
        Self {
            value,
            updated_at: Instant::now(),
        }
    }
}

/// Concurrent store of the latest custom and external metric values
pub struct MetricStore {
    custom: DashMap<CustomKey, StoredMetric<CustomMetricValue>>,
    external: DashMap<ExternalKey, StoredMetric<ExternalMetricValue>>,
    ttl: Duration,
}

impl Default for MetricStore {
    fn default() -> Self {
        Self::new(DEFAULT_METRIC_TTL)
    }
}

impl MetricStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            custom: DashMap::new(),
            external: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Insert or replace a value and refresh its timestamp
    pub fn insert(&self, value: CollectedMetric) {
        match value {
            CollectedMetric::Custom(value) => {
                let key = CustomKey {
                    group_resource: GroupResource::for_object(&value.described_object),
                    metric_name: value.metric_name.clone(),
                    namespace: value.described_object.namespace.clone(),
                    name: value.described_object.name.clone(),
                };
                self.custom.insert(key, StoredMetric::new(value));
            }
            CollectedMetric::External(value) => {
                let key = ExternalKey {
                    metric_name: value.metric_name.clone(),
                    namespace: value.namespace.clone(),
                    labels: value.labels.clone(),
                };
                self.external.insert(key, StoredMetric::new(value));
            }
        }
    }

    /// Look up the custom metric of a single named object. An empty
    /// namespace addresses root-scoped objects.
    pub fn get_metrics_by_name(
        &self,
        metric_name: &str,
        group_resource: &GroupResource,
        namespace: &str,
        name: &str,
    ) -> Option<CustomMetricValue> {
        let key = CustomKey {
            group_resource: group_resource.clone(),
            metric_name: metric_name.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        };

        self.custom.get(&key).map(|entry| entry.value.clone())
    }

    /// All custom metric values in the namespace whose object labels match
    /// the selector, ordered by object name
    pub fn get_metrics_by_selector(
        &self,
        metric_name: &str,
        group_resource: &GroupResource,
        namespace: &str,
        selector: &Selector,
    ) -> Vec<CustomMetricValue> {
        let mut values: Vec<CustomMetricValue> = self
            .custom
            .iter()
            .filter(|entry| {
                let key = entry.key();
                key.metric_name == metric_name
                    && key.group_resource == *group_resource
                    && key.namespace == namespace
                    && selector.matches(&entry.value().value.labels)
            })
            .map(|entry| entry.value().value.clone())
            .collect();

        values.sort_by(|a, b| a.described_object.name.cmp(&b.described_object.name));
        values
    }

    /// All external metric values in the namespace whose labels match the
    /// selector
    pub fn get_external_metric(
        &self,
        namespace: &str,
        metric_name: &str,
        selector: &Selector,
    ) -> Vec<ExternalMetricValue> {
        let mut values: Vec<ExternalMetricValue> = self
            .external
            .iter()
            .filter(|entry| {
                let key = entry.key();
                key.metric_name == metric_name
                    && key.namespace == namespace
                    && selector.matches(&key.labels)
            })
            .map(|entry| entry.value().value.clone())
            .collect();

        values.sort_by(|a, b| a.labels.cmp(&b.labels));
        values
    }

    /// Distinct custom metrics currently stored
    pub fn list_all_metrics(&self) -> Vec<CustomMetricInfo> {
        let infos: BTreeSet<CustomMetricInfo> = self
            .custom
            .iter()
            .map(|entry| {
                let key = entry.key();
                CustomMetricInfo {
                    group_resource: key.group_resource.clone(),
                    metric: key.metric_name.clone(),
                    namespaced: !key.namespace.is_empty(),
                }
            })
            .collect();

        infos.into_iter().collect()
    }

    /// Distinct external metrics currently stored
    pub fn list_all_external_metrics(&self) -> Vec<ExternalMetricInfo> {
        let infos: BTreeSet<ExternalMetricInfo> = self
            .external
            .iter()
            .map(|entry| ExternalMetricInfo {
                metric: entry.key().metric_name.clone(),
            })
            .collect();

        infos.into_iter().collect()
    }

    /// Drop every entry older than the TTL. Returns the number removed.
    pub fn remove_expired(&self) -> usize {
        let now = Instant::now();
        let ttl = self.ttl;
        let mut removed = 0;

        self.custom.retain(|_, stored| {
            let keep = now.duration_since(stored.updated_at) <= ttl;
            if !keep {
                removed += 1;
            }
            keep
        });

        self.external.retain(|_, stored| {
            let keep = now.duration_since(stored.updated_at) <= ttl;
            if !keep {
                removed += 1;
            }
            keep
        });

        removed
    }

    /// Total number of stored values
    pub fn len(&self) -> usize {
        self.custom.len() + self.external.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
