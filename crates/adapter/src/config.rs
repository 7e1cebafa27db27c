//! Adapter configuration

use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

/// Adapter configuration, read from `ADAPTER_*` environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct AdapterConfig {
    /// Instance name attached to structured log events
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Interval between autoscaler discovery passes in seconds
    #[serde(default = "default_hpa_discovery_interval")]
    pub hpa_discovery_interval_secs: u64,

    /// Collector polling interval in seconds, unless an autoscaler annotation overrides it
    #[serde(default = "default_collector_interval")]
    pub collector_interval_secs: u64,

    /// Age in seconds after which a stored metric value is evicted
    #[serde(default = "default_metric_ttl")]
    pub metric_ttl_secs: u64,

    /// Interval between metric store expiry sweeps in seconds
    #[serde(default = "default_gc_interval")]
    pub gc_interval_secs: u64,

    /// Capacity of the collector results channel
    #[serde(default = "default_sink_buffer")]
    pub sink_buffer: usize,
}

fn default_instance_name() -> String {
    std::env::var("POD_NAME").unwrap_or_else(|_| "metrics-adapter".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_hpa_discovery_interval() -> u64 {
    30
}

fn default_collector_interval() -> u64 {
    60
}

fn default_metric_ttl() -> u64 {
    15 * 60
}

fn default_gc_interval() -> u64 {
    10 * 60
}

fn default_sink_buffer() -> usize {
    1
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            api_port: default_api_port(),
            hpa_discovery_interval_secs: default_hpa_discovery_interval(),
            collector_interval_secs: default_collector_interval(),
            metric_ttl_secs: default_metric_ttl(),
            gc_interval_secs: default_gc_interval(),
            sink_buffer: default_sink_buffer(),
        }
    }
}

impl AdapterConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("ADAPTER").try_parsing(true))
            .build()
            .context("Failed to read adapter configuration")?;

        let config: Self = config
            .try_deserialize()
            .context("Invalid adapter configuration")?;

        Ok(config.or_defaults())
    }

    /// Replace zero intervals and a zero channel capacity with the defaults
    pub fn or_defaults(mut self) -> Self {
        fn non_zero<T: Default + PartialEq>(value: &mut T, default: T) {
            if *value == T::default() {
                *value = default;
            }
        }

        non_zero(&mut self.hpa_discovery_interval_secs, default_hpa_discovery_interval());
        non_zero(&mut self.collector_interval_secs, default_collector_interval());
        non_zero(&mut self.metric_ttl_secs, default_metric_ttl());
        non_zero(&mut self.gc_interval_secs, default_gc_interval());
        non_zero(&mut self.sink_buffer, default_sink_buffer());
        self
    }

    pub fn hpa_discovery_interval(&self) -> Duration {
        Duration::from_secs(self.hpa_discovery_interval_secs)
    }

    pub fn collector_interval(&self) -> Duration {
        Duration::from_secs(self.collector_interval_secs)
    }

    pub fn metric_ttl(&self) -> Duration {
        Duration::from_secs(self.metric_ttl_secs)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }
}
