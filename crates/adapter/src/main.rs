//! Metrics Adapter - custom and external metrics for HorizontalPodAutoscalers
//!
//! This binary discovers HPAs in the cluster, runs a collector for every
//! custom or external metric they declare and serves the collected values.

use adapter_lib::{
    collector::CollectorFactory,
    health::{components, HealthRegistry},
    observability::{AdapterMetrics, StructuredLogger},
    provider::{HpaProviderBuilder, KubeHpaLister},
};
use anyhow::{Context, Result};
use metrics_adapter::{api, config::AdapterConfig};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const ADAPTER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let config = AdapterConfig::load()?;
    info!(instance = %config.instance_name, api_port = config.api_port, "Adapter configured");

    let logger = StructuredLogger::new(&config.instance_name);
    logger.log_startup(ADAPTER_VERSION);

    let health_registry = HealthRegistry::new();
    health_registry.register(components::DISCOVERY).await;
    health_registry.register(components::SCHEDULER).await;
    health_registry.register(components::STORE).await;

    let metrics = AdapterMetrics::new();

    let client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    // Metric backends register their plugins here
    let collector_factory = CollectorFactory::new();
    if collector_factory.is_empty() {
        warn!("No collector plugins registered, custom and external metrics cannot be collected");
    }

    let shutdown = CancellationToken::new();

    let provider = Arc::new(
        HpaProviderBuilder::new()
            .lister(Arc::new(KubeHpaLister::new(client)))
            .collector_factory(Arc::new(collector_factory))
            .interval(config.hpa_discovery_interval())
            .collector_interval(config.collector_interval())
            .metric_ttl(config.metric_ttl())
            .gc_interval(config.gc_interval())
            .sink_buffer(config.sink_buffer)
            .health_registry(health_registry.clone())
            .instance(config.instance_name.clone())
            .shutdown_token(shutdown.clone())
            .build()?,
    );

    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        metrics,
        provider.clone(),
    ));

    let mut provider_handle = tokio::spawn(provider.run());

    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    let provider_stopped = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for shutdown signal")?;
            logger.log_shutdown("SIGINT received");
            false
        }
        result = api_handle => {
            match result {
                Ok(Ok(())) => logger.log_shutdown("API server stopped"),
                Ok(Err(e)) => error!(error = %format!("{e:#}"), "API server failed"),
                Err(e) => error!(error = %e, "API server task panicked"),
            }
            false
        }
        result = &mut provider_handle => {
            match result {
                Ok(()) => error!("HPA provider stopped unexpectedly"),
                Err(e) => error!(error = %e, "HPA provider task panicked"),
            }
            logger.log_shutdown("HPA provider stopped");
            true
        }
    };

    shutdown.cancel();
    health_registry.set_ready(false).await;

    if !provider_stopped {
        if let Err(e) = provider_handle.await {
            error!(error = %e, "HPA provider task panicked");
        }
    }

    info!("Shutdown complete");
    Ok(())
}
