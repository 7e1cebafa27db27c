//! Collector scheduling
//!
//! Keeps exactly one running collector task per (autoscaler, metric kind).
//! Each task is bound to its own cancellation token derived from the
//! scheduler's token, so a single collector can be stopped on its own and
//! process shutdown stops all of them.

use crate::collector::Collector;
use crate::models::{MetricCollection, MetricTypeName, ResourceReference};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

type CollectorTable = HashMap<ResourceReference, HashMap<MetricTypeName, CancellationToken>>;

/// Tracks all running collectors and stops them when they are replaced or
/// removed
pub struct CollectorScheduler {
    token: CancellationToken,
    table: Mutex<CollectorTable>,
    metric_sink: mpsc::Sender<MetricCollection>,
}

impl CollectorScheduler {
    /// Create a scheduler whose collectors publish to `metric_sink`.
    /// Cancelling `token` stops every collector started by the scheduler.
    pub fn new(token: CancellationToken, metric_sink: mpsc::Sender<MetricCollection>) -> Self {
        Self {
            token,
            table: Mutex::new(HashMap::new()),
            metric_sink,
        }
    }

    /// Start a collector for the given autoscaler and metric kind. A
    /// collector already running for the same key is stopped first.
    pub async fn add(
        &self,
        resource_ref: ResourceReference,
        type_name: MetricTypeName,
        collector: Arc<dyn Collector>,
    ) {
        let mut table = self.table.lock().await;
        let collectors = table.entry(resource_ref.clone()).or_default();

        if let Some(previous) = collectors.remove(&type_name) {
            debug!(
                resource = %resource_ref,
                metric = %type_name,
                "Stopping previous collector"
            );
            previous.cancel();
        }

        let token = self.token.child_token();
        collectors.insert(type_name.clone(), token.clone());

        tokio::spawn(collector_runner(
            resource_ref,
            type_name,
            token,
            collector,
            self.metric_sink.clone(),
        ));
    }

    /// Stop and forget every collector of an autoscaler. Returns the
    /// number of collectors stopped.
    pub async fn remove(&self, resource_ref: &ResourceReference) -> usize {
        let mut table = self.table.lock().await;

        match table.remove(resource_ref) {
            Some(collectors) => {
                for token in collectors.values() {
                    token.cancel();
                }
                collectors.len()
            }
            None => 0,
        }
    }

    /// Stop the collectors of an autoscaler whose metric kind is not in
    /// `keep`. Returns the number of collectors stopped.
    pub async fn retain(
        &self,
        resource_ref: &ResourceReference,
        keep: &HashSet<MetricTypeName>,
    ) -> usize {
        let mut table = self.table.lock().await;

        let Some(collectors) = table.get_mut(resource_ref) else {
            return 0;
        };

        let before = collectors.len();
        collectors.retain(|type_name, token| {
            let retained = keep.contains(type_name);
            if !retained {
                debug!(resource = %resource_ref, metric = %type_name, "Stopping stale collector");
                token.cancel();
            }
            retained
        });
        let stopped = before - collectors.len();

        if collectors.is_empty() {
            table.remove(resource_ref);
        }

        stopped
    }

    /// Number of running collectors
    pub async fn len(&self) -> usize {
        self.table.lock().await.values().map(HashMap::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Autoscalers that have at least one running collector
    pub async fn references(&self) -> Vec<ResourceReference> {
        self.table.lock().await.keys().cloned().collect()
    }

    /// Metric kinds with a running collector for an autoscaler, sorted
    pub async fn kinds(&self, resource_ref: &ResourceReference) -> Vec<MetricTypeName> {
        let table = self.table.lock().await;
        let mut kinds: Vec<MetricTypeName> = table
            .get(resource_ref)
            .map(|collectors| collectors.keys().cloned().collect())
            .unwrap_or_default();
        kinds.sort();
        kinds
    }
}

/// Run a collector at its interval until its token is cancelled. A fetch
/// that is already in flight when the token is cancelled is still
/// published.
async fn collector_runner(
    resource_ref: ResourceReference,
    type_name: MetricTypeName,
    token: CancellationToken,
    collector: Arc<dyn Collector>,
    metric_sink: mpsc::Sender<MetricCollection>,
) {
    loop {
        if token.is_cancelled() {
            break;
        }

        let collection = match collector.get_metrics().await {
            Ok(values) => MetricCollection {
                values,
                error: None,
            },
            Err(e) => MetricCollection {
                values: Vec::new(),
                error: Some(e.context(format!(
                    "collector {} for {} failed",
                    type_name, resource_ref
                ))),
            },
        };

        // Waits for the aggregation loop to accept the batch
        if metric_sink.send(collection).await.is_err() {
            debug!(resource = %resource_ref, metric = %type_name, "Metric sink closed");
            break;
        }

        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(collector.interval()) => {}
        }
    }

    debug!(resource = %resource_ref, metric = %type_name, "Stopped collector runner");
}
