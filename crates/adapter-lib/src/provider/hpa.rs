//! HPA driven metrics provider
//!
//! Discovers autoscalers, keeps one collector running per declared metric,
//! funnels collected values into the [`MetricStore`] and serves reads from
//! it.

use super::{CollectorScheduler, HpaLister, MetricStore};
use crate::collector::{parse_hpa_metrics, CollectorFactory};
use crate::error::MetricNotFound;
use crate::health::{components, HealthRegistry};
use crate::labels::Selector;
use crate::models::{
    CollectedMetric, CustomMetricInfo, CustomMetricValue, ExternalMetricInfo,
    ExternalMetricValue, GroupResource, MetricCollection, ResourceReference,
};
use crate::observability::{AdapterMetrics, StructuredLogger};
use anyhow::Result;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Configuration for the HPA provider
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Interval between autoscaler discovery passes (default: 30 seconds)
    pub interval: Duration,
    /// Collector polling interval when a metric sets none (default: 60 seconds)
    pub collector_interval: Duration,
    /// Interval between metric store expiry sweeps (default: 10 minutes)
    pub gc_interval: Duration,
    /// Age after which a stored value is evicted (default: 15 minutes)
    pub metric_ttl: Duration,
    /// Capacity of the collector results channel
    pub sink_buffer: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            collector_interval: Duration::from_secs(60),
            gc_interval: Duration::from_secs(10 * 60),
            metric_ttl: super::store::DEFAULT_METRIC_TTL,
            // Collectors wait for the store to take each batch
            sink_buffer: 1,
        }
    }
}

impl ProviderConfig {
    /// Replace zero intervals and a zero channel capacity with the defaults
    pub fn or_defaults(self) -> Self {
        let defaults = Self::default();
        let non_zero = |value: Duration, default: Duration| {
            if value.is_zero() {
                default
            } else {
                value
            }
        };

        Self {
            interval: non_zero(self.interval, defaults.interval),
            collector_interval: non_zero(self.collector_interval, defaults.collector_interval),
            gc_interval: non_zero(self.gc_interval, defaults.gc_interval),
            metric_ttl: non_zero(self.metric_ttl, defaults.metric_ttl),
            sink_buffer: if self.sink_buffer == 0 {
                defaults.sink_buffer
            } else {
                self.sink_buffer
            },
        }
    }
}

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Autoscalers returned by the lister
    pub listed: usize,
    /// New or changed autoscalers whose collectors were set up
    pub updated: usize,
    /// Autoscalers whose collectors could not be fully set up
    pub failed: usize,
    /// Autoscalers that disappeared and had their collectors stopped
    pub removed: usize,
}

/// Returns true if two autoscalers declare the same collection jobs, i.e.
/// their metadata and spec are equal. Status is never compared.
pub fn equal_hpa(a: &HorizontalPodAutoscaler, b: &HorizontalPodAutoscaler) -> bool {
    comparable_metadata(&a.metadata) == comparable_metadata(&b.metadata) && a.spec == b.spec
}

// resourceVersion and managedFields change on every status update
fn comparable_metadata(metadata: &ObjectMeta) -> ObjectMeta {
    ObjectMeta {
        resource_version: None,
        managed_fields: None,
        ..metadata.clone()
    }
}

/// Metrics provider backed by collectors derived from HPA resources
pub struct HpaProvider {
    lister: Arc<dyn HpaLister>,
    collector_factory: Arc<CollectorFactory>,
    config: ProviderConfig,
    scheduler: CollectorScheduler,
    metric_store: Arc<MetricStore>,
    metric_sink_rx: Mutex<Option<mpsc::Receiver<MetricCollection>>>,
    hpa_cache: Mutex<HashMap<ResourceReference, HorizontalPodAutoscaler>>,
    health: HealthRegistry,
    metrics: AdapterMetrics,
    logger: StructuredLogger,
    shutdown: CancellationToken,
}

impl HpaProvider {
    fn new(
        lister: Arc<dyn HpaLister>,
        collector_factory: Arc<CollectorFactory>,
        config: ProviderConfig,
        health: HealthRegistry,
        logger: StructuredLogger,
        shutdown: CancellationToken,
    ) -> Self {
        let (metric_sink, metric_sink_rx) = mpsc::channel(config.sink_buffer);
        let scheduler = CollectorScheduler::new(shutdown.child_token(), metric_sink);

        Self {
            lister,
            collector_factory,
            metric_store: Arc::new(MetricStore::new(config.metric_ttl)),
            config,
            scheduler,
            metric_sink_rx: Mutex::new(Some(metric_sink_rx)),
            hpa_cache: Mutex::new(HashMap::new()),
            health,
            metrics: AdapterMetrics::new(),
            logger,
            shutdown,
        }
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &CollectorScheduler {
        &self.scheduler
    }

    pub fn metric_store(&self) -> &Arc<MetricStore> {
        &self.metric_store
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    /// Token that stops the provider and every task it started
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Autoscalers whose collectors are fully set up, sorted
    pub async fn tracked_autoscalers(&self) -> Vec<ResourceReference> {
        let mut refs: Vec<ResourceReference> = self.hpa_cache.lock().await.keys().cloned().collect();
        refs.sort();
        refs
    }

    /// Run autoscaler discovery and metric collection until the shutdown
    /// token is cancelled
    pub async fn run(self: Arc<Self>) {
        let Some(metric_sink_rx) = self.metric_sink_rx.lock().await.take() else {
            warn!("HPA provider is already running");
            return;
        };

        info!(
            interval_secs = self.config.interval.as_secs(),
            collector_interval_secs = self.config.collector_interval.as_secs(),
            "Starting HPA provider"
        );

        let collect = tokio::spawn(self.clone().collect_metrics(metric_sink_rx));
        let gc = tokio::spawn(self.clone().garbage_collect());
        let background = {
            let provider = self.clone();
            tokio::spawn(async move {
                tokio::join!(
                    provider.supervise(components::SCHEDULER, collect),
                    provider.supervise(components::STORE, gc),
                );
            })
        };

        loop {
            if let Err(e) = self.update_hpas().await {
                error!(error = %format!("{e:#}"), "Failed to update HPAs");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {}
                _ = self.shutdown.cancelled() => {
                    info!("Stopped HPA provider");
                    break;
                }
            }
        }

        let _ = background.await;
    }

    /// Wait for a background task and mark `component` unhealthy if the
    /// task ends before shutdown
    pub(crate) async fn supervise(&self, component: &'static str, task: JoinHandle<()>) {
        let outcome = task.await;
        if self.shutdown.is_cancelled() {
            return;
        }

        let message = match outcome {
            Ok(()) => "Background task exited".to_string(),
            Err(e) => format!("Background task failed: {e}"),
        };
        error!(component, error = %message, "Background task stopped");
        self.health.set_unhealthy(component, message).await;
    }

    /// Run one reconciliation pass: set up collectors for new and changed
    /// autoscalers and stop the collectors of removed ones. A failure to
    /// list autoscalers leaves all collectors untouched.
    pub async fn update_hpas(&self) -> Result<ReconcileReport> {
        let start = Instant::now();
        debug!("Looking for HPAs");

        let hpas = match self.lister.list().await {
            Ok(hpas) => hpas,
            Err(e) => {
                self.metrics.inc_list_errors();
                self.health
                    .set_degraded(components::DISCOVERY, format!("{e:#}"))
                    .await;
                return Err(e);
            }
        };

        let mut hpa_cache = self.hpa_cache.lock().await;
        let mut new_cache = HashMap::with_capacity(hpas.len());
        let mut live = HashSet::with_capacity(hpas.len());
        let mut report = ReconcileReport {
            listed: hpas.len(),
            ..Default::default()
        };

        for hpa in hpas {
            let resource_ref =
                ResourceReference::new(hpa.namespace().unwrap_or_default(), hpa.name_any());
            live.insert(resource_ref.clone());

            let unchanged = hpa_cache
                .get(&resource_ref)
                .map(|cached| equal_hpa(cached, &hpa))
                .unwrap_or(false);

            if !unchanged {
                report.updated += 1;

                // Not caching the HPA makes the next pass retry all of its
                // collectors
                if !self.setup_collectors(&resource_ref, &hpa).await {
                    report.failed += 1;
                    continue;
                }
            }

            new_cache.insert(resource_ref, hpa);
        }

        // Collectors may be running for uncached HPAs after a partial
        // failure, so the scheduler is consulted as well
        let mut stale: HashSet<ResourceReference> = hpa_cache.keys().cloned().collect();
        stale.extend(self.scheduler.references().await);

        for resource_ref in stale.difference(&live) {
            let stopped = self.scheduler.remove(resource_ref).await;
            debug!(
                resource = %resource_ref,
                collectors = stopped,
                "Removed previously scheduled metrics collectors"
            );
            report.removed += 1;
        }

        *hpa_cache = new_cache;

        self.metrics.set_autoscalers_tracked(hpa_cache.len());
        self.metrics
            .set_collectors_running(self.scheduler.len().await);
        self.metrics.observe_reconcile_latency(start.elapsed());
        self.logger
            .log_reconcile(report.listed, report.updated, report.failed, report.removed);

        self.health.set_healthy(components::DISCOVERY).await;
        self.health.set_ready(true).await;

        Ok(report)
    }

    /// Create and schedule a collector for every metric of a new or changed
    /// HPA. Collectors of metrics the HPA no longer declares, or that failed
    /// to build, are stopped. Returns false if any step failed.
    async fn setup_collectors(
        &self,
        resource_ref: &ResourceReference,
        hpa: &HorizontalPodAutoscaler,
    ) -> bool {
        let configs = match parse_hpa_metrics(hpa) {
            Ok(configs) => configs,
            Err(e) => {
                error!(resource = %resource_ref, error = %e, "Failed to parse HPA metrics");
                self.scheduler.remove(resource_ref).await;
                return false;
            }
        };

        let mut complete = true;
        let mut scheduled = HashSet::with_capacity(configs.len());

        for config in configs {
            let interval = config.interval.unwrap_or(self.config.collector_interval);

            match self.collector_factory.new_collector(hpa, &config, interval) {
                Ok(collector) => {
                    self.logger.log_collector_added(
                        resource_ref,
                        &config.metric_type_name,
                        &config.collector_name,
                        interval,
                    );
                    self.scheduler
                        .add(resource_ref.clone(), config.metric_type_name.clone(), collector)
                        .await;
                    scheduled.insert(config.metric_type_name);
                }
                Err(e) => {
                    error!(
                        resource = %resource_ref,
                        metric = %config.metric_type_name,
                        error = %e,
                        "Failed to create new metrics collector"
                    );
                    self.metrics.inc_collector_build_errors();
                    complete = false;
                }
            }
        }

        let stopped = self.scheduler.retain(resource_ref, &scheduled).await;
        if stopped > 0 {
            debug!(resource = %resource_ref, collectors = stopped, "Stopped stale collectors");
        }

        complete
    }

    /// Drain collector results into the metric store until shutdown
    async fn collect_metrics(self: Arc<Self>, mut metric_sink_rx: mpsc::Receiver<MetricCollection>) {
        loop {
            tokio::select! {
                collection = metric_sink_rx.recv() => match collection {
                    Some(collection) => self.store_collection(collection),
                    None => break,
                },
                _ = self.shutdown.cancelled() => {
                    info!("Stopped metrics collection");
                    break;
                }
            }
        }
    }

    fn store_collection(&self, collection: MetricCollection) {
        if let Some(e) = &collection.error {
            self.metrics.inc_collection_errors();
            error!(error = %format!("{e:#}"), "Failed to collect metrics");
        }

        debug!(count = collection.values.len(), "Collected new metric(s)");
        self.metrics.inc_metrics_collected(collection.values.len());

        for value in collection.values {
            match &value {
                CollectedMetric::Custom(custom) => self.logger.log_custom_metric(custom),
                CollectedMetric::External(external) => self.logger.log_external_metric(external),
            }
            self.metric_store.insert(value);
        }

        self.metrics.set_stored_metrics(self.metric_store.len());
    }

    /// Periodically evict expired values from the metric store
    async fn garbage_collect(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.gc_interval) => {
                    let removed = self.metric_store.remove_expired();
                    if removed > 0 {
                        debug!(removed, "Removed expired metrics");
                        self.metrics.inc_expired_metrics(removed);
                    }
                    self.metrics.set_stored_metrics(self.metric_store.len());
                }
                _ = self.shutdown.cancelled() => {
                    info!("Stopped metrics store garbage collection");
                    break;
                }
            }
        }
    }

    /// Metric of a root-scoped object by name
    pub fn get_root_scoped_metric_by_name(
        &self,
        group_resource: &GroupResource,
        name: &str,
        metric_name: &str,
    ) -> Result<CustomMetricValue, MetricNotFound> {
        self.get_namespaced_metric_by_name(group_resource, "", name, metric_name)
    }

    /// Metrics of root-scoped objects matching a label selector
    pub fn get_root_scoped_metric_by_selector(
        &self,
        group_resource: &GroupResource,
        selector: &Selector,
        metric_name: &str,
    ) -> Vec<CustomMetricValue> {
        self.metric_store
            .get_metrics_by_selector(metric_name, group_resource, "", selector)
    }

    /// Metric of a namespaced object by name
    pub fn get_namespaced_metric_by_name(
        &self,
        group_resource: &GroupResource,
        namespace: &str,
        name: &str,
        metric_name: &str,
    ) -> Result<CustomMetricValue, MetricNotFound> {
        self.metric_store
            .get_metrics_by_name(metric_name, group_resource, namespace, name)
            .ok_or_else(|| MetricNotFound {
                group_resource: group_resource.clone(),
                metric_name: metric_name.to_string(),
                name: name.to_string(),
            })
    }

    /// Metrics of namespaced objects matching a label selector
    pub fn get_namespaced_metric_by_selector(
        &self,
        group_resource: &GroupResource,
        namespace: &str,
        selector: &Selector,
        metric_name: &str,
    ) -> Vec<CustomMetricValue> {
        self.metric_store
            .get_metrics_by_selector(metric_name, group_resource, namespace, selector)
    }

    pub fn get_external_metric(
        &self,
        namespace: &str,
        metric_name: &str,
        selector: &Selector,
    ) -> Vec<ExternalMetricValue> {
        self.metric_store
            .get_external_metric(namespace, metric_name, selector)
    }

    pub fn list_all_metrics(&self) -> Vec<CustomMetricInfo> {
        self.metric_store.list_all_metrics()
    }

    pub fn list_all_external_metrics(&self) -> Vec<ExternalMetricInfo> {
        self.metric_store.list_all_external_metrics()
    }
}

/// Builder for creating the HPA provider
pub struct HpaProviderBuilder {
    lister: Option<Arc<dyn HpaLister>>,
    collector_factory: Option<Arc<CollectorFactory>>,
    config: ProviderConfig,
    health: Option<HealthRegistry>,
    instance: String,
    shutdown: Option<CancellationToken>,
}

impl HpaProviderBuilder {
    pub fn new() -> Self {
        Self {
            lister: None,
            collector_factory: None,
            config: ProviderConfig::default(),
            health: None,
            instance: "metrics-adapter".to_string(),
            shutdown: None,
        }
    }

    /// Set the autoscaler lister
    pub fn lister(mut self, lister: Arc<dyn HpaLister>) -> Self {
        self.lister = Some(lister);
        self
    }

    /// Set the collector factory
    pub fn collector_factory(mut self, factory: Arc<CollectorFactory>) -> Self {
        self.collector_factory = Some(factory);
        self
    }

    /// Set the discovery interval
    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    /// Set the default collector polling interval
    pub fn collector_interval(mut self, interval: Duration) -> Self {
        self.config.collector_interval = interval;
        self
    }

    /// Set the metric store expiry sweep interval
    pub fn gc_interval(mut self, interval: Duration) -> Self {
        self.config.gc_interval = interval;
        self
    }

    /// Set the metric store TTL
    pub fn metric_ttl(mut self, ttl: Duration) -> Self {
        self.config.metric_ttl = ttl;
        self
    }

    /// Set the capacity of the collector results channel
    pub fn sink_buffer(mut self, size: usize) -> Self {
        self.config.sink_buffer = size;
        self
    }

    /// Share a health registry with the provider
    pub fn health_registry(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Instance name attached to structured log events
    pub fn instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = instance.into();
        self
    }

    /// Token whose cancellation stops the provider
    pub fn shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    pub fn build(self) -> Result<HpaProvider> {
        let lister = self
            .lister
            .ok_or_else(|| anyhow::anyhow!("HPA lister is required"))?;
        let collector_factory = self
            .collector_factory
            .ok_or_else(|| anyhow::anyhow!("Collector factory is required"))?;

        Ok(HpaProvider::new(
            lister,
            collector_factory,
            self.config.or_defaults(),
            self.health.unwrap_or_default(),
            StructuredLogger::new(self.instance),
            self.shutdown.unwrap_or_default(),
        ))
    }
}

impl Default for HpaProviderBuilder {
    fn default() -> Self {
        Self::new()
    }
}
