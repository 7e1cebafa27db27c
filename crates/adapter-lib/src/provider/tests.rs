//! Reconciliation tests for the HPA provider
//!
//! These tests drive the provider with an in-memory autoscaler lister and a
//! recording collector plugin, so no API server or metric backend is needed.

#[cfg(test)]
mod provider_tests {
    use crate::collector::{async_trait, Collector, CollectorFactory, MetricConfig};
    use crate::health::{components, ComponentStatus, HealthRegistry};
    use crate::labels::Selector;
    use crate::models::{
        CollectedMetric, CustomMetricInfo, CustomMetricValue, ExternalMetricInfo,
        ExternalMetricValue, GroupResource, MetricSourceType, MetricTypeName, ObjectReference,
        ResourceReference,
    };
    use crate::provider::{equal_hpa, HpaLister, HpaProvider, HpaProviderBuilder, ReconcileReport};
    use anyhow::Result;
    use k8s_openapi::api::autoscaling::v2::{
        ExternalMetricSource, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec,
        HorizontalPodAutoscalerStatus, MetricIdentifier, MetricSpec, MetricTarget,
        PodsMetricSource,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    /// Lister returning whatever the test last configured
    struct MockLister {
        result: Mutex<Result<Vec<HorizontalPodAutoscaler>, String>>,
    }

    impl MockLister {
        fn new(hpas: Vec<HorizontalPodAutoscaler>) -> Arc<Self> {
            Arc::new(Self {
                result: Mutex::new(Ok(hpas)),
            })
        }

        fn set(&self, hpas: Vec<HorizontalPodAutoscaler>) {
            *self.result.lock().unwrap() = Ok(hpas);
        }

        fn fail(&self, message: &str) {
            *self.result.lock().unwrap() = Err(message.to_string());
        }
    }

    #[async_trait]
    impl HpaLister for MockLister {
        async fn list(&self) -> Result<Vec<HorizontalPodAutoscaler>> {
            self.result
                .lock()
                .unwrap()
                .clone()
                .map_err(|e| anyhow::anyhow!(e))
        }
    }

    /// Reports one value for the metric it was built for
    struct TestCollector {
        namespace: String,
        type_name: MetricTypeName,
        interval: Duration,
    }

    #[async_trait]
    impl Collector for TestCollector {
        async fn get_metrics(&self) -> Result<Vec<CollectedMetric>> {
            let metric_name = self.type_name.metric_name.clone();

            let value = match self.type_name.source_type {
                MetricSourceType::External => CollectedMetric::External(ExternalMetricValue {
                    metric_name,
                    namespace: self.namespace.clone(),
                    labels: BTreeMap::from([("queue".to_string(), "orders".to_string())]),
                    value: 7.0,
                    timestamp: chrono::Utc::now(),
                }),
                _ => CollectedMetric::Custom(CustomMetricValue {
                    metric_name,
                    value: 42.0,
                    described_object: ObjectReference {
                        api_version: "v1".to_string(),
                        kind: "Pod".to_string(),
                        namespace: self.namespace.clone(),
                        name: "pod-a".to_string(),
                    },
                    labels: BTreeMap::from([("app".to_string(), "web".to_string())]),
                    timestamp: chrono::Utc::now(),
                }),
            };

            Ok(vec![value])
        }

        fn interval(&self) -> Duration {
            self.interval
        }
    }

    type Builds = Arc<Mutex<Vec<(MetricTypeName, Duration)>>>;

    /// Factory whose default plugins record every build. Metrics named
    /// `broken-*` cannot be built.
    fn recording_factory() -> (Arc<CollectorFactory>, Builds) {
        let builds: Builds = Arc::default();

        let plugin = {
            let builds = builds.clone();
            Arc::new(
                move |hpa: &HorizontalPodAutoscaler,
                      config: &MetricConfig,
                      interval: Duration|
                      -> Result<Arc<dyn Collector>> {
                    let type_name = config.metric_type_name.clone();
                    if type_name.metric_name.starts_with("broken") {
                        anyhow::bail!("backend for {} is not configured", type_name);
                    }

                    builds.lock().unwrap().push((type_name.clone(), interval));
                    Ok(Arc::new(TestCollector {
                        namespace: hpa.metadata.namespace.clone().unwrap_or_default(),
                        type_name,
                        interval,
                    }))
                },
            )
        };

        let mut factory = CollectorFactory::new();
        factory.register_pods_plugin("", plugin.clone());
        factory.register_external_plugin("", plugin);

        (Arc::new(factory), builds)
    }

    fn build_count(builds: &Builds) -> usize {
        builds.lock().unwrap().len()
    }

    fn pods_metric(name: &str) -> MetricSpec {
        MetricSpec {
            type_: "Pods".to_string(),
            pods: Some(PodsMetricSource {
                metric: MetricIdentifier {
                    name: name.to_string(),
                    selector: None,
                },
                target: MetricTarget::default(),
            }),
            ..Default::default()
        }
    }

    fn external_metric(name: &str) -> MetricSpec {
        MetricSpec {
            type_: "External".to_string(),
            external: Some(ExternalMetricSource {
                metric: MetricIdentifier {
                    name: name.to_string(),
                    selector: None,
                },
                target: MetricTarget::default(),
            }),
            ..Default::default()
        }
    }

    fn hpa(name: &str, metrics: Vec<MetricSpec>) -> HorizontalPodAutoscaler {
        HorizontalPodAutoscaler {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns1".to_string()),
                resource_version: Some("1".to_string()),
                ..Default::default()
            },
            spec: Some(HorizontalPodAutoscalerSpec {
                metrics: Some(metrics),
                max_replicas: 10,
                ..Default::default()
            }),
            status: None,
        }
    }

    fn with_annotation(mut hpa: HorizontalPodAutoscaler, key: &str, value: &str) -> HorizontalPodAutoscaler {
        hpa.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
        hpa
    }

    fn hpa1() -> HorizontalPodAutoscaler {
        hpa(
            "hpa1",
            vec![pods_metric("requests-per-second"), external_metric("queue-length")],
        )
    }

    fn hpa1_ref() -> ResourceReference {
        ResourceReference::new("ns1", "hpa1")
    }

    fn rps() -> MetricTypeName {
        MetricTypeName::new(MetricSourceType::Pods, "requests-per-second")
    }

    fn queue_length() -> MetricTypeName {
        MetricTypeName::new(MetricSourceType::External, "queue-length")
    }

    fn provider(lister: Arc<MockLister>, factory: Arc<CollectorFactory>) -> HpaProvider {
        HpaProviderBuilder::new()
            .lister(lister)
            .collector_factory(factory)
            .build()
            .unwrap()
    }

    #[test]
    fn test_equal_hpa_ignores_volatile_fields() {
        let a = hpa1();

        let mut b = hpa1();
        b.metadata.resource_version = Some("2".to_string());
        b.status = Some(HorizontalPodAutoscalerStatus {
            current_replicas: Some(3),
            desired_replicas: 4,
            ..Default::default()
        });
        assert!(equal_hpa(&a, &b));

        let mut c = hpa1();
        c.spec.as_mut().unwrap().max_replicas = 20;
        assert!(!equal_hpa(&a, &c));

        let d = with_annotation(hpa1(), "team", "payments");
        assert!(!equal_hpa(&a, &d));
    }

    #[test]
    fn test_builder_requires_lister_and_factory() {
        let (factory, _) = recording_factory();
        assert!(HpaProviderBuilder::new()
            .collector_factory(factory)
            .build()
            .is_err());
        assert!(HpaProviderBuilder::new()
            .lister(MockLister::new(vec![]))
            .build()
            .is_err());
    }

    #[test]
    fn test_builder_replaces_zero_intervals() {
        let (factory, _) = recording_factory();
        let provider = HpaProviderBuilder::new()
            .lister(MockLister::new(vec![]))
            .collector_factory(factory)
            .interval(Duration::ZERO)
            .collector_interval(Duration::ZERO)
            .gc_interval(Duration::ZERO)
            .metric_ttl(Duration::ZERO)
            .sink_buffer(0)
            .build()
            .unwrap();

        let config = provider.config();
        assert_eq!(config.interval, Duration::from_secs(30));
        assert_eq!(config.collector_interval, Duration::from_secs(60));
        assert_eq!(config.gc_interval, Duration::from_secs(600));
        assert_eq!(config.metric_ttl, Duration::from_secs(900));
        assert_eq!(config.sink_buffer, 1);
        assert_eq!(provider.metric_store().ttl(), Duration::from_secs(900));
    }

    #[tokio::test]
    async fn test_stopped_background_task_marks_component_unhealthy() {
        let (factory, _) = recording_factory();
        let health = HealthRegistry::new();
        health.register(components::STORE).await;
        health.register(components::SCHEDULER).await;
        health.set_ready(true).await;

        let provider = HpaProviderBuilder::new()
            .lister(MockLister::new(vec![]))
            .collector_factory(factory)
            .health_registry(health.clone())
            .build()
            .unwrap();

        let failed = tokio::spawn(async { panic!("sweep failed"); });
        provider.supervise(components::STORE, failed).await;

        let store = health.get(components::STORE).await.unwrap();
        assert_eq!(store.status, ComponentStatus::Unhealthy);
        assert!(!health.readiness().await.ready);

        let exited = tokio::spawn(async {});
        provider.supervise(components::SCHEDULER, exited).await;
        let scheduler = health.get(components::SCHEDULER).await.unwrap();
        assert_eq!(scheduler.status, ComponentStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_background_task_ending_on_shutdown_is_healthy() {
        let (factory, _) = recording_factory();
        let health = HealthRegistry::new();
        health.register(components::STORE).await;
        let token = CancellationToken::new();

        let provider = HpaProviderBuilder::new()
            .lister(MockLister::new(vec![]))
            .collector_factory(factory)
            .health_registry(health.clone())
            .shutdown_token(token.clone())
            .build()
            .unwrap();

        token.cancel();
        provider
            .supervise(components::STORE, tokio::spawn(async {}))
            .await;

        let store = health.get(components::STORE).await.unwrap();
        assert_eq!(store.status, ComponentStatus::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_hpas_schedules_collectors() {
        let (factory, builds) = recording_factory();
        let provider = provider(MockLister::new(vec![hpa1()]), factory);

        let report = provider.update_hpas().await.unwrap();
        assert_eq!(
            report,
            ReconcileReport {
                listed: 1,
                updated: 1,
                failed: 0,
                removed: 0
            }
        );

        let mut expected = vec![rps(), queue_length()];
        expected.sort();
        assert_eq!(provider.scheduler().kinds(&hpa1_ref()).await, expected);
        assert_eq!(provider.tracked_autoscalers().await, vec![hpa1_ref()]);
        assert_eq!(build_count(&builds), 2);

        let readiness = provider.health().readiness().await;
        assert!(readiness.ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_hpa_is_not_rebuilt() {
        let (factory, builds) = recording_factory();
        let lister = MockLister::new(vec![hpa1()]);
        let provider = provider(lister.clone(), factory);

        provider.update_hpas().await.unwrap();

        // Only status and resourceVersion differ
        let mut refreshed = hpa1();
        refreshed.metadata.resource_version = Some("7".to_string());
        refreshed.status = Some(HorizontalPodAutoscalerStatus {
            desired_replicas: 2,
            ..Default::default()
        });
        lister.set(vec![refreshed]);

        let report = provider.update_hpas().await.unwrap();
        assert_eq!(report.listed, 1);
        assert_eq!(report.updated, 0);
        assert_eq!(build_count(&builds), 2);
        assert_eq!(provider.scheduler().len().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spec_change_replaces_collectors() {
        let (factory, builds) = recording_factory();
        let lister = MockLister::new(vec![hpa1()]);
        let provider = provider(lister.clone(), factory);

        provider.update_hpas().await.unwrap();

        lister.set(vec![hpa(
            "hpa1",
            vec![pods_metric("requests-per-second"), pods_metric("latency")],
        )]);

        let report = provider.update_hpas().await.unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(build_count(&builds), 4);

        let mut expected = vec![rps(), MetricTypeName::new(MetricSourceType::Pods, "latency")];
        expected.sort();
        assert_eq!(provider.scheduler().kinds(&hpa1_ref()).await, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_hpa_stops_collectors() {
        let (factory, _) = recording_factory();
        let lister = MockLister::new(vec![hpa1(), hpa("hpa2", vec![pods_metric("latency")])]);
        let provider = provider(lister.clone(), factory);

        provider.update_hpas().await.unwrap();
        assert_eq!(provider.scheduler().len().await, 3);

        lister.set(vec![hpa("hpa2", vec![pods_metric("latency")])]);

        let report = provider.update_hpas().await.unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(report.updated, 0);
        assert!(provider.scheduler().kinds(&hpa1_ref()).await.is_empty());
        assert_eq!(
            provider.tracked_autoscalers().await,
            vec![ResourceReference::new("ns1", "hpa2")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_build_failure_is_retried() {
        let (factory, builds) = recording_factory();
        let broken = hpa(
            "hpa1",
            vec![pods_metric("requests-per-second"), pods_metric("broken-metric")],
        );
        let lister = MockLister::new(vec![broken.clone()]);
        let provider = provider(lister.clone(), factory);

        let report = provider.update_hpas().await.unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(report.failed, 1);

        // The working metric is collected but the HPA is not cached
        assert_eq!(provider.scheduler().kinds(&hpa1_ref()).await, vec![rps()]);
        assert!(provider.tracked_autoscalers().await.is_empty());
        assert_eq!(build_count(&builds), 1);

        // The unchanged HPA is retried on the next pass
        let report = provider.update_hpas().await.unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(build_count(&builds), 2);
        assert_eq!(provider.scheduler().len().await, 1);

        // Deleting the never cached HPA still stops its collectors
        lister.set(vec![]);
        let report = provider.update_hpas().await.unwrap();
        assert_eq!(report.removed, 1);
        assert!(provider.scheduler().is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_failure_leaves_collectors_untouched() {
        let (factory, builds) = recording_factory();
        let lister = MockLister::new(vec![hpa1()]);
        let health = HealthRegistry::new();
        health.register(components::DISCOVERY).await;

        let provider = HpaProviderBuilder::new()
            .lister(lister.clone())
            .collector_factory(factory)
            .health_registry(health.clone())
            .build()
            .unwrap();

        tokio_test::assert_ok!(provider.update_hpas().await);

        lister.fail("connection refused");
        let err = tokio_test::assert_err!(provider.update_hpas().await);
        assert!(err.to_string().contains("connection refused"));

        assert_eq!(provider.scheduler().len().await, 2);
        assert_eq!(provider.tracked_autoscalers().await, vec![hpa1_ref()]);
        assert_eq!(build_count(&builds), 2);

        let discovery = health.get(components::DISCOVERY).await.unwrap();
        assert_eq!(discovery.status, ComponentStatus::Degraded);

        lister.set(vec![hpa1()]);
        let report = provider.update_hpas().await.unwrap();
        assert_eq!(report.updated, 0);

        let discovery = health.get(components::DISCOVERY).await.unwrap();
        assert_eq!(discovery.status, ComponentStatus::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parse_failure_removes_collectors() {
        let (factory, _) = recording_factory();
        let lister = MockLister::new(vec![hpa1()]);
        let provider = provider(lister.clone(), factory);

        provider.update_hpas().await.unwrap();
        assert_eq!(provider.scheduler().len().await, 2);

        let mut invalid = hpa1();
        invalid
            .spec
            .as_mut()
            .unwrap()
            .metrics
            .as_mut()
            .unwrap()
            .push(MetricSpec {
                type_: "Bogus".to_string(),
                ..Default::default()
            });
        lister.set(vec![invalid]);

        let report = provider.update_hpas().await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(provider.scheduler().is_empty().await);
        assert!(provider.tracked_autoscalers().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_interval_annotation_fails_only_that_hpa() {
        let (factory, builds) = recording_factory();
        let invalid = with_annotation(
            hpa1(),
            "metric-config.pods.requests-per-second.json-path/interval",
            "99999999999999999999h",
        );
        let lister = MockLister::new(vec![invalid, hpa("hpa2", vec![pods_metric("latency")])]);
        let provider = provider(lister, factory);

        let report = tokio_test::assert_ok!(provider.update_hpas().await);
        assert_eq!(report.listed, 2);
        assert_eq!(report.failed, 1);

        assert!(provider.scheduler().kinds(&hpa1_ref()).await.is_empty());
        assert_eq!(
            provider.tracked_autoscalers().await,
            vec![ResourceReference::new("ns1", "hpa2")]
        );
        assert_eq!(build_count(&builds), 1);

        // The loop keeps going on later passes
        let report = tokio_test::assert_ok!(provider.update_hpas().await);
        assert_eq!(report.failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_annotation_interval_overrides_default() {
        let (factory, builds) = recording_factory();
        let annotated = with_annotation(
            hpa1(),
            "metric-config.pods.requests-per-second.json-path/interval",
            "10s",
        );

        let provider = HpaProviderBuilder::new()
            .lister(MockLister::new(vec![annotated]))
            .collector_factory(factory)
            .collector_interval(Duration::from_secs(45))
            .build()
            .unwrap();

        provider.update_hpas().await.unwrap();

        let builds = builds.lock().unwrap().clone();
        let interval_of = |type_name: MetricTypeName| {
            builds
                .iter()
                .find(|(name, _)| *name == type_name)
                .map(|(_, interval)| *interval)
        };

        assert_eq!(interval_of(rps()), Some(Duration::from_secs(10)));
        assert_eq!(interval_of(queue_length()), Some(Duration::from_secs(45)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_collects_and_serves_metrics() {
        let (factory, _) = recording_factory();
        let token = CancellationToken::new();

        let provider = Arc::new(
            HpaProviderBuilder::new()
                .lister(MockLister::new(vec![hpa1()]))
                .collector_factory(factory)
                .interval(Duration::from_secs(30))
                .collector_interval(Duration::from_secs(10))
                .shutdown_token(token.clone())
                .build()
                .unwrap(),
        );

        let handle = tokio::spawn(provider.clone().run());
        tokio::time::sleep(Duration::from_secs(1)).await;

        let pods = GroupResource::new("", "pods");

        let value = provider
            .get_namespaced_metric_by_name(&pods, "ns1", "pod-a", "requests-per-second")
            .unwrap();
        assert_eq!(value.value, 42.0);

        let selector: Selector = "app=web".parse().unwrap();
        let values =
            provider.get_namespaced_metric_by_selector(&pods, "ns1", &selector, "requests-per-second");
        assert_eq!(values.len(), 1);

        let selector: Selector = "app=db".parse().unwrap();
        assert!(provider
            .get_namespaced_metric_by_selector(&pods, "ns1", &selector, "requests-per-second")
            .is_empty());

        let external = provider.get_external_metric("ns1", "queue-length", &Selector::everything());
        assert_eq!(external.len(), 1);
        assert_eq!(external[0].value, 7.0);

        assert_eq!(
            provider.list_all_metrics(),
            vec![CustomMetricInfo {
                group_resource: pods.clone(),
                metric: "requests-per-second".to_string(),
                namespaced: true,
            }]
        );
        assert_eq!(
            provider.list_all_external_metrics(),
            vec![ExternalMetricInfo {
                metric: "queue-length".to_string(),
            }]
        );

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_metric_is_not_found() {
        let (factory, _) = recording_factory();
        let provider = provider(MockLister::new(vec![]), factory);
        let pods = GroupResource::new("", "pods");

        let err = provider
            .get_namespaced_metric_by_name(&pods, "ns1", "pod-a", "requests-per-second")
            .unwrap_err();
        assert_eq!(err.metric_name, "requests-per-second");
        assert_eq!(err.name, "pod-a");

        assert!(provider
            .get_root_scoped_metric_by_name(&GroupResource::new("", "nodes"), "node-1", "load")
            .is_err());
        assert!(provider
            .get_root_scoped_metric_by_selector(
                &GroupResource::new("", "nodes"),
                &Selector::everything(),
                "load"
            )
            .is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_metrics_are_garbage_collected() {
        let (factory, _) = recording_factory();
        let token = CancellationToken::new();
        let lister = MockLister::new(vec![hpa1()]);

        let provider = Arc::new(
            HpaProviderBuilder::new()
                .lister(lister.clone())
                .collector_factory(factory)
                .interval(Duration::from_secs(10))
                .collector_interval(Duration::from_secs(5))
                .metric_ttl(Duration::from_secs(60))
                .gc_interval(Duration::from_secs(30))
                .shutdown_token(token.clone())
                .build()
                .unwrap(),
        );

        let handle = tokio::spawn(provider.clone().run());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(provider.metric_store().len(), 2);

        // The next pass stops the collectors, so nothing refreshes the values
        lister.set(vec![]);
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(provider.scheduler().is_empty().await);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(provider.metric_store().is_empty());

        token.cancel();
        handle.await.unwrap();
    }
}
