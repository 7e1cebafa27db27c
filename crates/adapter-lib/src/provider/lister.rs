//! Autoscaler discovery

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use kube::api::{Api, ListParams};
use kube::Client;

/// Source of the autoscaler resources the adapter collects metrics for
#[async_trait]
pub trait HpaLister: Send + Sync {
    /// List all autoscalers across all namespaces
    async fn list(&self) -> Result<Vec<HorizontalPodAutoscaler>>;
}

/// Lists autoscalers from the Kubernetes API server
#[derive(Clone)]
pub struct KubeHpaLister {
    api: Api<HorizontalPodAutoscaler>,
}

impl KubeHpaLister {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl HpaLister for KubeHpaLister {
    async fn list(&self) -> Result<Vec<HorizontalPodAutoscaler>> {
        let list = self
            .api
            .list(&ListParams::default())
            .await
            .context("Failed to list HorizontalPodAutoscalers")?;

        Ok(list.items)
    }
}
