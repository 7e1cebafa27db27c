//! Metric collectors
//!
//! A collector fetches the current value(s) for one metric kind of one
//! autoscaler. Concrete collectors are provided by plugins registered in a
//! [`CollectorFactory`]; the factory resolves the plugin for a parsed
//! [`MetricConfig`] and builds a collector bound to it.

mod config;

pub use config::{parse_duration, parse_hpa_metrics, MetricConfig, ANNOTATION_PREFIX};

use crate::error::CollectorError;
use crate::models::{CollectedMetric, MetricSourceType};
use anyhow::Result;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub use async_trait::async_trait;

/// Trait for metric collector implementations
#[async_trait]
pub trait Collector: Send + Sync {
    /// Fetch the current values for the bound metric
    async fn get_metrics(&self) -> Result<Vec<CollectedMetric>>;

    /// How long to wait between two fetches
    fn interval(&self) -> Duration;
}

/// Builds collectors for one family of metric backends
pub trait CollectorPlugin: Send + Sync {
    fn new_collector(
        &self,
        hpa: &HorizontalPodAutoscaler,
        config: &MetricConfig,
        interval: Duration,
    ) -> Result<Arc<dyn Collector>>;
}

impl<F> CollectorPlugin for F
where
    F: Fn(&HorizontalPodAutoscaler, &MetricConfig, Duration) -> Result<Arc<dyn Collector>>
        + Send
        + Sync,
{
    fn new_collector(
        &self,
        hpa: &HorizontalPodAutoscaler,
        config: &MetricConfig,
        interval: Duration,
    ) -> Result<Arc<dyn Collector>> {
        self(hpa, config, interval)
    }
}

/// Registry of collector plugins keyed by metric source type and
/// collector name. An empty collector name registers the default plugin
/// for that source type.
#[derive(Default)]
pub struct CollectorFactory {
    plugins: HashMap<(MetricSourceType, String), Arc<dyn CollectorPlugin>>,
}

impl CollectorFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin for a source type and collector name
    pub fn register_plugin(
        &mut self,
        source_type: MetricSourceType,
        collector_name: impl Into<String>,
        plugin: Arc<dyn CollectorPlugin>,
    ) {
        let collector_name = collector_name.into();
        tracing::debug!(
            source_type = %source_type,
            collector = %collector_name,
            "Registered collector plugin"
        );
        self.plugins.insert((source_type, collector_name), plugin);
    }

    pub fn register_pods_plugin(
        &mut self,
        collector_name: impl Into<String>,
        plugin: Arc<dyn CollectorPlugin>,
    ) {
        self.register_plugin(MetricSourceType::Pods, collector_name, plugin);
    }

    pub fn register_object_plugin(
        &mut self,
        collector_name: impl Into<String>,
        plugin: Arc<dyn CollectorPlugin>,
    ) {
        self.register_plugin(MetricSourceType::Object, collector_name, plugin);
    }

    pub fn register_external_plugin(
        &mut self,
        collector_name: impl Into<String>,
        plugin: Arc<dyn CollectorPlugin>,
    ) {
        self.register_plugin(MetricSourceType::External, collector_name, plugin);
    }

    /// Number of registered plugins
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Build a collector for a metric config, falling back to the default
    /// plugin of the source type when no named plugin matches
    pub fn new_collector(
        &self,
        hpa: &HorizontalPodAutoscaler,
        config: &MetricConfig,
        interval: Duration,
    ) -> Result<Arc<dyn Collector>, CollectorError> {
        let source_type = config.metric_type_name.source_type;

        let plugin = self
            .plugins
            .get(&(source_type, config.collector_name.clone()))
            .or_else(|| self.plugins.get(&(source_type, String::new())))
            .ok_or_else(|| CollectorError::NoPlugin {
                metric_type_name: config.metric_type_name.clone(),
                collector_name: config.collector_name.clone(),
            })?;

        plugin
            .new_collector(hpa, config, interval)
            .map_err(|source| CollectorError::Plugin {
                metric_type_name: config.metric_type_name.clone(),
                source,
            })
    }
}
