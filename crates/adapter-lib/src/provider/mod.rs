//! Custom and external metrics provider
//!
//! This module ties autoscaler discovery, collector scheduling and the
//! expiring metric store together into the [`HpaProvider`].

mod hpa;
mod lister;
mod scheduler;
mod store;

#[cfg(test)]
mod tests;

pub use hpa::{equal_hpa, HpaProvider, HpaProviderBuilder, ProviderConfig, ReconcileReport};
pub use lister::{HpaLister, KubeHpaLister};
pub use scheduler::CollectorScheduler;
pub use store::{MetricStore, DEFAULT_METRIC_TTL};
