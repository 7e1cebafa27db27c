//! Collection job configuration
//!
//! Derives one [`MetricConfig`] per custom or external metric declared by an
//! autoscaler. Collector selection and per-collector settings are read from
//! annotations of the form
//! `metric-config.<type>.<metric-name>.<collector>/<key>: <value>`, e.g.
//! `metric-config.pods.requests-per-second.json-path/interval: "30s"`.

use crate::error::ConfigError;
use crate::models::{MetricSourceType, MetricTypeName};
use k8s_openapi::api::autoscaling::v2::{CrossVersionObjectReference, HorizontalPodAutoscaler};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::debug;

/// Prefix of annotations carrying collector configuration
pub const ANNOTATION_PREFIX: &str = "metric-config.";

/// Config key holding the polling interval override
const INTERVAL_KEY: &str = "interval";

/// Configuration of a single collection job
#[derive(Debug, Clone, PartialEq)]
pub struct MetricConfig {
    pub metric_type_name: MetricTypeName,
    /// Collector plugin to use; empty selects the default plugin
    pub collector_name: String,
    /// Polling interval override
    pub interval: Option<Duration>,
    /// Collector specific settings from annotations
    pub config: BTreeMap<String, String>,
    /// Described object for `Object` metrics
    pub object_reference: Option<CrossVersionObjectReference>,
    /// Metric selector declared in the autoscaler spec
    pub metric_selector: Option<LabelSelector>,
}

impl MetricConfig {
    pub fn new(metric_type_name: MetricTypeName) -> Self {
        Self {
            metric_type_name,
            collector_name: String::new(),
            interval: None,
            config: BTreeMap::new(),
            object_reference: None,
            metric_selector: None,
        }
    }
}

#[derive(Debug, Default)]
struct AnnotationConfig {
    collector_name: String,
    interval: Option<Duration>,
    config: BTreeMap<String, String>,
}

/// Derive the collection jobs declared by an autoscaler
pub fn parse_hpa_metrics(hpa: &HorizontalPodAutoscaler) -> Result<Vec<MetricConfig>, ConfigError> {
    let spec = hpa.spec.as_ref().ok_or(ConfigError::MissingSpec)?;
    let mut annotations = parse_annotations(hpa.metadata.annotations.as_ref())?;

    let mut configs = Vec::new();

    for metric in spec.metrics.iter().flatten() {
        let (source_type, source) = match metric.type_.as_str() {
            "Pods" => {
                let pods = metric
                    .pods
                    .as_ref()
                    .ok_or(ConfigError::MissingMetricSource(MetricSourceType::Pods))?;
                (MetricSourceType::Pods, (&pods.metric, None))
            }
            "Object" => {
                let object = metric
                    .object
                    .as_ref()
                    .ok_or(ConfigError::MissingMetricSource(MetricSourceType::Object))?;
                (
                    MetricSourceType::Object,
                    (&object.metric, Some(object.described_object.clone())),
                )
            }
            "External" => {
                let external = metric
                    .external
                    .as_ref()
                    .ok_or(ConfigError::MissingMetricSource(MetricSourceType::External))?;
                (MetricSourceType::External, (&external.metric, None))
            }
            // Resource metrics are served by the resource metrics API
            "Resource" | "ContainerResource" => continue,
            other => return Err(ConfigError::UnknownMetricType(other.to_string())),
        };

        let (identifier, object_reference) = source;
        let metric_type_name = MetricTypeName::new(source_type, identifier.name.clone());

        let mut config = MetricConfig {
            object_reference,
            metric_selector: identifier.selector.clone(),
            ..MetricConfig::new(metric_type_name.clone())
        };

        if let Some(annotation) = annotations.remove(&metric_type_name) {
            config.collector_name = annotation.collector_name;
            config.interval = annotation.interval;
            config.config = annotation.config;
        }

        configs.push(config);
    }

    Ok(configs)
}

fn parse_annotations(
    annotations: Option<&BTreeMap<String, String>>,
) -> Result<HashMap<MetricTypeName, AnnotationConfig>, ConfigError> {
    let mut parsed: HashMap<MetricTypeName, AnnotationConfig> = HashMap::new();

    for (key, value) in annotations.into_iter().flatten() {
        let Some(rest) = key.strip_prefix(ANNOTATION_PREFIX) else {
            continue;
        };

        let Some((path, config_key)) = rest.split_once('/') else {
            debug!(annotation = %key, "Ignoring metric-config annotation without config key");
            continue;
        };

        // <type>.<metric-name>.<collector>; metric names may contain dots
        let Some((type_part, rest)) = path.split_once('.') else {
            continue;
        };
        let Some((metric_name, collector_name)) = rest.rsplit_once('.') else {
            continue;
        };

        let source_type = match type_part {
            "pods" => MetricSourceType::Pods,
            "object" => MetricSourceType::Object,
            "external" => MetricSourceType::External,
            _ => {
                debug!(annotation = %key, "Ignoring metric-config annotation for unknown metric type");
                continue;
            }
        };

        let entry = parsed
            .entry(MetricTypeName::new(source_type, metric_name))
            .or_default();
        entry.collector_name = collector_name.to_string();

        if config_key == INTERVAL_KEY {
            let interval = parse_duration(value).ok_or_else(|| ConfigError::InvalidInterval {
                annotation: key.clone(),
                value: value.clone(),
            })?;
            entry.interval = Some(interval).filter(|d| !d.is_zero());
        } else {
            entry.config.insert(config_key.to_string(), value.clone());
        }
    }

    Ok(parsed)
}

/// Parse durations like `500ms`, `30s`, `1m30s` or `2h`
pub fn parse_duration(s: &str) -> Option<Duration> {
    let mut rest = s.trim();
    if rest.is_empty() {
        return None;
    }

    let mut total = Duration::ZERO;

    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return None;
        }
        let value: f64 = rest[..number_len].parse().ok()?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let seconds = match &rest[..unit_len] {
            "ms" => value / 1000.0,
            "s" => value,
            "m" => value * 60.0,
            "h" => value * 3600.0,
            _ => return None,
        };
        rest = &rest[unit_len..];

        let component = Duration::try_from_secs_f64(seconds).ok()?;
        total = total.checked_add(component)?;
    }

    Some(total)
}
