//! Observability infrastructure for the metrics adapter
//!
//! Provides:
//! - Prometheus metrics (reconcile latency, tracked autoscalers, running collectors, stored values)
//! - Structured JSON logging with tracing

use crate::models::{
    format_labels, CustomMetricValue, ExternalMetricValue, MetricTypeName, ResourceReference,
};
use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter,
    IntGauge,
};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{info, warn};

/// Histogram buckets for reconcile pass duration (in seconds)
const RECONCILE_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<AdapterMetricsInner> = OnceLock::new();

struct AdapterMetricsInner {
    reconcile_latency_seconds: Histogram,
    autoscalers_tracked: IntGauge,
    collectors_running: IntGauge,
    stored_metrics: IntGauge,
    metrics_collected: IntCounter,
    collection_errors: IntCounter,
    collector_build_errors: IntCounter,
    list_errors: IntCounter,
    expired_metrics: IntCounter,
}

impl AdapterMetricsInner {
    fn new() -> Self {
        Self {
            reconcile_latency_seconds: register_histogram!(
                "metrics_adapter_reconcile_latency_seconds",
                "Time spent on one autoscaler reconciliation pass",
                RECONCILE_BUCKETS.to_vec()
            )
            .expect("Failed to register reconcile_latency_seconds"),

            autoscalers_tracked: register_int_gauge!(
                "metrics_adapter_autoscalers_tracked",
                "Number of autoscalers with fully set up collectors"
            )
            .expect("Failed to register autoscalers_tracked"),

            collectors_running: register_int_gauge!(
                "metrics_adapter_collectors_running",
                "Number of metric collectors currently scheduled"
            )
            .expect("Failed to register collectors_running"),

            stored_metrics: register_int_gauge!(
                "metrics_adapter_stored_metrics",
                "Number of metric values held in the metric store"
            )
            .expect("Failed to register stored_metrics"),

            metrics_collected: register_int_counter!(
                "metrics_adapter_metrics_collected_total",
                "Total number of metric values received from collectors"
            )
            .expect("Failed to register metrics_collected"),

            collection_errors: register_int_counter!(
                "metrics_adapter_collection_errors_total",
                "Total number of failed collector fetches"
            )
            .expect("Failed to register collection_errors"),

            collector_build_errors: register_int_counter!(
                "metrics_adapter_collector_build_errors_total",
                "Total number of collectors that could not be created"
            )
            .expect("Failed to register collector_build_errors"),

            list_errors: register_int_counter!(
                "metrics_adapter_list_errors_total",
                "Total number of failed autoscaler list calls"
            )
            .expect("Failed to register list_errors"),

            expired_metrics: register_int_counter!(
                "metrics_adapter_expired_metrics_total",
                "Total number of metric values evicted after expiring"
            )
            .expect("Failed to register expired_metrics"),
        }
    }
}

/// Adapter metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct AdapterMetrics {
    _private: (),
}

impl Default for AdapterMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AdapterMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AdapterMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AdapterMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    pub fn observe_reconcile_latency(&self, duration: Duration) {
        self.inner()
            .reconcile_latency_seconds
            .observe(duration.as_secs_f64());
    }

    pub fn set_autoscalers_tracked(&self, count: usize) {
        self.inner().autoscalers_tracked.set(count as i64);
    }

    pub fn set_collectors_running(&self, count: usize) {
        self.inner().collectors_running.set(count as i64);
    }

    pub fn set_stored_metrics(&self, count: usize) {
        self.inner().stored_metrics.set(count as i64);
    }

    pub fn inc_metrics_collected(&self, count: usize) {
        self.inner().metrics_collected.inc_by(count as u64);
    }

    pub fn inc_collection_errors(&self) {
        self.inner().collection_errors.inc();
    }

    pub fn inc_collector_build_errors(&self) {
        self.inner().collector_build_errors.inc();
    }

    pub fn inc_list_errors(&self) {
        self.inner().list_errors.inc();
    }

    pub fn inc_expired_metrics(&self, count: usize) {
        self.inner().expired_metrics.inc_by(count as u64);
    }
}

/// Structured logger for adapter events
///
/// Provides consistent JSON-formatted logging for collector lifecycle,
/// collected values and reconciliation results.
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn log_startup(&self, version: &str) {
        info!(
            event = "adapter_started",
            instance = %self.instance,
            adapter_version = %version,
            "Metrics adapter started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "adapter_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Metrics adapter shutting down"
        );
    }

    pub fn log_collector_added(
        &self,
        resource: &ResourceReference,
        metric: &MetricTypeName,
        collector_name: &str,
        interval: Duration,
    ) {
        info!(
            event = "collector_added",
            instance = %self.instance,
            resource = %resource,
            metric = %metric,
            collector = %collector_name,
            interval_secs = interval.as_secs_f64(),
            "Adding new metrics collector"
        );
    }

    pub fn log_custom_metric(&self, value: &CustomMetricValue) {
        info!(
            event = "metric_collected",
            instance = %self.instance,
            metric = %value.metric_name,
            value = value.value,
            kind = %value.described_object.kind,
            namespace = %value.described_object.namespace,
            name = %value.described_object.name,
            "Collected new custom metric"
        );
    }

    pub fn log_external_metric(&self, value: &ExternalMetricValue) {
        info!(
            event = "metric_collected",
            instance = %self.instance,
            metric = %value.metric_name,
            value = value.value,
            namespace = %value.namespace,
            labels = %format_labels(&value.labels),
            "Collected new external metric"
        );
    }

    pub fn log_reconcile(&self, listed: usize, updated: usize, failed: usize, removed: usize) {
        if failed > 0 {
            warn!(
                event = "reconcile_complete",
                instance = %self.instance,
                listed,
                updated,
                failed,
                removed,
                "Reconciled HPAs with collector setup failures"
            );
        } else {
            info!(
                event = "reconcile_complete",
                instance = %self.instance,
                listed,
                updated,
                removed,
                "Found {} new/updated HPA(s)",
                updated
            );
        }
    }
}
