//! Metrics adapter library
//!
//! This crate provides the core functionality for:
//! - Deriving collection jobs from HorizontalPodAutoscaler resources
//! - Scheduling one collector per autoscaler metric
//! - Storing collected values with expiry and serving queries
//! - Health checks and observability

pub mod collector;
pub mod error;
pub mod health;
pub mod labels;
pub mod models;
pub mod observability;
pub mod provider;

pub use error::{CollectorError, ConfigError, MetricNotFound};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use labels::Selector;
pub use models::*;
pub use observability::{AdapterMetrics, StructuredLogger};
pub use provider::{HpaProvider, HpaProviderBuilder, ProviderConfig, ReconcileReport};
