//! HTTP API for health checks, Prometheus metrics and metric queries

use adapter_lib::{
    health::{ComponentStatus, HealthRegistry},
    labels::Selector,
    models::GroupResource,
    observability::AdapterMetrics,
    provider::HpaProvider,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: AdapterMetrics,
    pub provider: Arc<HpaProvider>,
}

impl AppState {
    pub fn new(
        health_registry: HealthRegistry,
        metrics: AdapterMetrics,
        provider: Arc<HpaProvider>,
    ) -> Self {
        Self {
            health_registry,
            metrics,
            provider,
        }
    }
}

/// Query parameters of metric lookups: `name` selects a single object,
/// otherwise `labelSelector` (default: everything) filters objects
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricQuery {
    name: Option<String>,
    label_selector: Option<String>,
}

impl MetricQuery {
    fn selector(&self) -> Result<Selector, Response> {
        match self.label_selector.as_deref() {
            None | Some("") => Ok(Selector::everything()),
            Some(s) => s.parse().map_err(|e| {
                (StatusCode::BAD_REQUEST, format!("invalid label selector: {e}")).into_response()
            }),
        }
    }
}

/// `pods` or `deployments.apps`
fn parse_group_resource(s: &str) -> GroupResource {
    match s.split_once('.') {
        Some((resource, group)) => GroupResource::new(group, resource),
        None => GroupResource::new("", s),
    }
}

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy | ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 once the first discovery pass has completed
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

async fn list_custom_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.provider.list_all_metrics())
}

async fn list_external_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.provider.list_all_external_metrics())
}

async fn namespaced_metric(
    State(state): State<Arc<AppState>>,
    Path((namespace, resource, metric)): Path<(String, String, String)>,
    Query(query): Query<MetricQuery>,
) -> Response {
    let group_resource = parse_group_resource(&resource);

    if let Some(name) = &query.name {
        return match state
            .provider
            .get_namespaced_metric_by_name(&group_resource, &namespace, name, &metric)
        {
            Ok(value) => Json(value).into_response(),
            Err(e) => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
        };
    }

    let selector = match query.selector() {
        Ok(selector) => selector,
        Err(response) => return response,
    };

    Json(state.provider.get_namespaced_metric_by_selector(
        &group_resource,
        &namespace,
        &selector,
        &metric,
    ))
    .into_response()
}

async fn root_scoped_metric(
    State(state): State<Arc<AppState>>,
    Path((resource, metric)): Path<(String, String)>,
    Query(query): Query<MetricQuery>,
) -> Response {
    let group_resource = parse_group_resource(&resource);

    if let Some(name) = &query.name {
        return match state
            .provider
            .get_root_scoped_metric_by_name(&group_resource, name, &metric)
        {
            Ok(value) => Json(value).into_response(),
            Err(e) => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
        };
    }

    let selector = match query.selector() {
        Ok(selector) => selector,
        Err(response) => return response,
    };

    Json(
        state
            .provider
            .get_root_scoped_metric_by_selector(&group_resource, &selector, &metric),
    )
    .into_response()
}

async fn external_metric(
    State(state): State<Arc<AppState>>,
    Path((namespace, metric)): Path<(String, String)>,
    Query(query): Query<MetricQuery>,
) -> Response {
    let selector = match query.selector() {
        Ok(selector) => selector,
        Err(response) => return response,
    };

    Json(state.provider.get_external_metric(&namespace, &metric, &selector)).into_response()
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/custom-metrics", get(list_custom_metrics))
        .route(
            "/custom-metrics/namespaces/:namespace/:resource/:metric",
            get(namespaced_metric),
        )
        .route(
            "/custom-metrics/cluster/:resource/:metric",
            get(root_scoped_metric),
        )
        .route("/external-metrics", get(list_external_metrics))
        .route(
            "/external-metrics/namespaces/:namespace/:metric",
            get(external_metric),
        )
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
