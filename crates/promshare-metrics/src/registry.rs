use std::{
    collections::HashMap,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use promshare_common::error::{PromshareError, Result};
use promshare_common::types::{CollectedSample, MetricDescriptor, MetricKind};
use promshare_storage::traits::Adapter;
use tracing::debug;

use crate::metric::{Counter, Gauge, Histogram, Summary};
use crate::render::render;

/// Descriptors known to this process, keyed by exposition name.
///
/// The registry never holds aggregate values. Two registries in different
/// processes that share a backing store see the same samples.
pub struct MetricsRegistry {
    adapter: Arc<dyn Adapter>,
    metrics: RwLock<HashMap<String, Arc<MetricDescriptor>>>,
}

impl MetricsRegistry {
    pub fn new(adapter: Arc<dyn Adapter>) -> Self {
        Self {
            adapter,
            metrics: RwLock::new(HashMap::new()),
        }
    }

    pub fn adapter(&self) -> &Arc<dyn Adapter> {
        &self.adapter
    }

    pub fn register_counter(
        &self,
        namespace: &str,
        name: &str,
        help: &str,
        label_names: &[&str],
    ) -> Result<Counter> {
        let descriptor = MetricDescriptor::counter(namespace, name, help, label_names)?;
        let descriptor = self.register(descriptor)?;
        Ok(Counter::new(descriptor, Arc::clone(&self.adapter)))
    }

    pub fn register_gauge(
        &self,
        namespace: &str,
        name: &str,
        help: &str,
        label_names: &[&str],
    ) -> Result<Gauge> {
        let descriptor = MetricDescriptor::gauge(namespace, name, help, label_names)?;
        let descriptor = self.register(descriptor)?;
        Ok(Gauge::new(descriptor, Arc::clone(&self.adapter)))
    }

    /// An empty `buckets` slice selects the default boundaries.
    pub fn register_histogram(
        &self,
        namespace: &str,
        name: &str,
        help: &str,
        label_names: &[&str],
        buckets: &[f64],
    ) -> Result<Histogram> {
        let descriptor = MetricDescriptor::histogram(namespace, name, help, label_names, buckets)?;
        let descriptor = self.register(descriptor)?;
        Ok(Histogram::new(descriptor, Arc::clone(&self.adapter)))
    }

    /// An empty `quantiles` slice selects the default quantiles.
    pub fn register_summary(
        &self,
        namespace: &str,
        name: &str,
        help: &str,
        label_names: &[&str],
        quantiles: &[f64],
        max_age_seconds: u64,
    ) -> Result<Summary> {
        let descriptor = MetricDescriptor::summary(
            namespace,
            name,
            help,
            label_names,
            quantiles,
            max_age_seconds,
        )?;
        let descriptor = self.register(descriptor)?;
        Ok(Summary::new(descriptor, Arc::clone(&self.adapter)))
    }

    pub fn get_counter(&self, namespace: &str, name: &str) -> Result<Counter> {
        let descriptor = self.lookup(namespace, name, MetricKind::Counter)?;
        Ok(Counter::new(descriptor, Arc::clone(&self.adapter)))
    }

    pub fn get_gauge(&self, namespace: &str, name: &str) -> Result<Gauge> {
        let descriptor = self.lookup(namespace, name, MetricKind::Gauge)?;
        Ok(Gauge::new(descriptor, Arc::clone(&self.adapter)))
    }

    pub fn get_histogram(&self, namespace: &str, name: &str) -> Result<Histogram> {
        let descriptor = self.lookup(namespace, name, MetricKind::Histogram)?;
        Ok(Histogram::new(descriptor, Arc::clone(&self.adapter)))
    }

    pub fn get_summary(&self, namespace: &str, name: &str) -> Result<Summary> {
        let descriptor = self.lookup(namespace, name, MetricKind::Summary)?;
        Ok(Summary::new(descriptor, Arc::clone(&self.adapter)))
    }

    /// Every sample in the backing store, including samples written by other
    /// processes for metrics this registry never registered.
    pub async fn collect(&self) -> Result<Vec<CollectedSample>> {
        self.adapter.collect().await
    }

    pub async fn render(&self) -> Result<String> {
        let samples = self.collect().await?;
        Ok(render(&samples))
    }

    pub async fn wipe_storage(&self) -> Result<()> {
        self.adapter.wipe_storage().await
    }

    fn register(&self, descriptor: MetricDescriptor) -> Result<Arc<MetricDescriptor>> {
        let full_name = descriptor.full_name();
        let mut metrics = self.metrics_write()?;

        if let Some(existing) = metrics.get(&full_name) {
            if **existing == descriptor {
                return Ok(Arc::clone(existing));
            }
            return Err(PromshareError::DescriptorConflict(format!(
                "{full_name} is already registered with a different definition"
            )));
        }

        debug!(
            metric = %full_name,
            kind = descriptor.kind().as_prometheus_type(),
            backend = self.adapter.backend_name(),
            "registered metric"
        );
        let descriptor = Arc::new(descriptor);
        metrics.insert(full_name, Arc::clone(&descriptor));
        Ok(descriptor)
    }

    fn lookup(
        &self,
        namespace: &str,
        name: &str,
        kind: MetricKind,
    ) -> Result<Arc<MetricDescriptor>> {
        let metrics = self.metrics_read()?;
        metrics
            .values()
            .find(|descriptor| {
                descriptor.namespace == namespace
                    && descriptor.name == name
                    && descriptor.kind() == kind
            })
            .cloned()
            .ok_or_else(|| {
                PromshareError::MetricNotFound(format!(
                    "no {} registered as {namespace:?}/{name:?}",
                    kind.as_prometheus_type()
                ))
            })
    }

    fn metrics_read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, Arc<MetricDescriptor>>>> {
        self.metrics.read().map_err(|_| {
            PromshareError::InternalError("failed to acquire metrics registry lock".to_string())
        })
    }

    fn metrics_write(
        &self,
    ) -> Result<RwLockWriteGuard<'_, HashMap<String, Arc<MetricDescriptor>>>> {
        self.metrics.write().map_err(|_| {
            PromshareError::InternalError("failed to acquire metrics registry lock".to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, TimeZone, Utc};
    use futures::future::join_all;
    use promshare_common::time::ManualClock;
    use promshare_common::types::AggregateValue;
    use promshare_storage::{CasAdapter, CasConfig, MemoryAdapter, MemoryCasStore};

    use super::*;

    fn memory_registry() -> MetricsRegistry {
        MetricsRegistry::new(Arc::new(MemoryAdapter::new()))
    }

    fn shared_registry(store: &Arc<MemoryCasStore>) -> MetricsRegistry {
        MetricsRegistry::new(Arc::new(CasAdapter::new(store.clone(), CasConfig::default())))
    }

    #[tokio::test]
    async fn re_registration_is_idempotent() {
        let registry = memory_registry();
        let first = registry
            .register_counter("app", "requests_total", "Requests", &["method"])
            .unwrap();
        let second = registry
            .register_counter("app", "requests_total", "Requests", &["method"])
            .unwrap();

        first.inc(&["GET"]).await.unwrap();
        second.inc_by(&["GET"], 2.0).await.unwrap();

        let samples = registry.collect().await.unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].value, AggregateValue::Counter(3.0));
    }

    #[test]
    fn conflicting_registration_fails() {
        let registry = memory_registry();
        registry
            .register_counter("app", "requests_total", "Requests", &["method"])
            .unwrap();

        assert!(matches!(
            registry.register_counter("app", "requests_total", "Requests", &["path"]),
            Err(PromshareError::DescriptorConflict(_))
        ));
        assert!(matches!(
            registry.register_gauge("app", "requests_total", "Requests", &["method"]),
            Err(PromshareError::DescriptorConflict(_))
        ));

        registry
            .register_histogram("app", "latency", "Latency", &[], &[1.0, 2.0])
            .unwrap();
        assert!(matches!(
            registry.register_histogram("app", "latency", "Latency", &[], &[1.0, 3.0]),
            Err(PromshareError::DescriptorConflict(_))
        ));
    }

    #[tokio::test]
    async fn lookups_respect_kind() {
        let registry = memory_registry();
        registry.register_gauge("app", "workers", "Workers", &[]).unwrap();

        let gauge = registry.get_gauge("app", "workers").unwrap();
        gauge.set(&[], 4.0).await.unwrap();

        assert!(matches!(
            registry.get_counter("app", "workers"),
            Err(PromshareError::MetricNotFound(_))
        ));
        assert!(matches!(
            registry.get_gauge("other", "workers"),
            Err(PromshareError::MetricNotFound(_))
        ));
    }

    #[tokio::test]
    async fn misuse_is_rejected_before_storage() {
        let registry = memory_registry();
        let counter = registry
            .register_counter("app", "jobs_total", "Jobs", &["queue"])
            .unwrap();
        let gauge = registry.register_gauge("app", "depth", "Depth", &[]).unwrap();

        assert!(matches!(
            counter.inc(&[]).await,
            Err(PromshareError::LabelMismatch { expected: 1, actual: 0, .. })
        ));
        assert!(matches!(
            counter.inc_by(&["default"], -1.0).await,
            Err(PromshareError::InvalidArgument(_))
        ));
        assert!(matches!(
            gauge.set(&[], f64::NAN).await,
            Err(PromshareError::InvalidArgument(_))
        ));
        assert!(registry.collect().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn registries_sharing_a_store_total_exactly() {
        let store = Arc::new(MemoryCasStore::new());
        let first = shared_registry(&store);
        let second = shared_registry(&store);

        let left = first
            .register_counter("test", "some_counter", "it increases", &["type"])
            .unwrap();
        let right = second
            .register_counter("test", "some_counter", "it increases", &["type"])
            .unwrap();

        let left_task = tokio::spawn(async move {
            for _ in 0..1000 {
                left.inc(&["blue"]).await.unwrap();
            }
        });
        let right_task = tokio::spawn(async move {
            for _ in 0..1000 {
                right.inc(&["blue"]).await.unwrap();
            }
        });
        left_task.await.unwrap();
        right_task.await.unwrap();

        let rendered = first.render().await.unwrap();
        assert_eq!(
            rendered,
            "# HELP test_some_counter it increases\n\
             # TYPE test_some_counter counter\n\
             test_some_counter{type=\"blue\"} 2000\n"
        );
        assert_eq!(second.render().await.unwrap(), rendered);
    }

    #[tokio::test]
    async fn renders_histogram_end_to_end() {
        let registry = memory_registry();
        let histogram = registry
            .register_histogram(
                "test",
                "some_histogram",
                "this is for testing",
                &["foo", "bar"],
                &[0.1, 1.0, 2.0, 3.5, 4.0, 6.0],
            )
            .unwrap();

        join_all([
            histogram.observe(&["lalal", "lululu"], 2.0),
            histogram.observe(&["lalal", "lululu"], 5.0),
        ])
        .await
        .into_iter()
        .collect::<Result<Vec<_>>>()
        .unwrap();

        assert_eq!(
            registry.render().await.unwrap(),
            "# HELP test_some_histogram this is for testing\n\
             # TYPE test_some_histogram histogram\n\
             test_some_histogram_bucket{foo=\"lalal\",bar=\"lululu\",le=\"0.1\"} 0\n\
             test_some_histogram_bucket{foo=\"lalal\",bar=\"lululu\",le=\"1\"} 0\n\
             test_some_histogram_bucket{foo=\"lalal\",bar=\"lululu\",le=\"2\"} 1\n\
             test_some_histogram_bucket{foo=\"lalal\",bar=\"lululu\",le=\"3.5\"} 1\n\
             test_some_histogram_bucket{foo=\"lalal\",bar=\"lululu\",le=\"4\"} 1\n\
             test_some_histogram_bucket{foo=\"lalal\",bar=\"lululu\",le=\"6\"} 2\n\
             test_some_histogram_bucket{foo=\"lalal\",bar=\"lululu\",le=\"+Inf\"} 2\n\
             test_some_histogram_sum{foo=\"lalal\",bar=\"lululu\"} 7\n\
             test_some_histogram_count{foo=\"lalal\",bar=\"lululu\"} 2\n"
        );
    }

    #[tokio::test]
    async fn reader_renders_metrics_it_never_registered() {
        let store = Arc::new(MemoryCasStore::new());
        let writer = shared_registry(&store);
        let reader = shared_registry(&store);

        let gauge = writer
            .register_gauge("test", "some_gauge", "this is for testing", &[])
            .unwrap();
        gauge.set(&[], 234.0).await.unwrap();
        gauge.set(&[], 123.0).await.unwrap();

        assert!(reader.get_gauge("test", "some_gauge").is_err());
        assert_eq!(
            reader.render().await.unwrap(),
            "# HELP test_some_gauge this is for testing\n\
             # TYPE test_some_gauge gauge\n\
             test_some_gauge 123\n"
        );
    }

    #[tokio::test]
    async fn summary_window_expires_observations() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        let adapter = MemoryAdapter::new().with_clock(Arc::new(clock.clone()));
        let registry = MetricsRegistry::new(Arc::new(adapter));

        let summary = registry
            .register_summary("test", "payload_bytes", "Payload size", &[], &[0.5], 60)
            .unwrap();
        for value in [10.0, 20.0, 30.0] {
            summary.observe(&[], value).await.unwrap();
        }

        let rendered = registry.render().await.unwrap();
        assert!(rendered.contains("test_payload_bytes{quantile=\"0.5\"} 20\n"));

        clock.advance(Duration::seconds(61));
        let rendered = registry.render().await.unwrap();
        assert!(rendered.contains("test_payload_bytes{quantile=\"0.5\"} NaN\n"));
        assert!(rendered.contains("test_payload_bytes_count 0\n"));
    }

    #[tokio::test]
    async fn wipe_clears_samples_but_keeps_registrations() {
        let registry = memory_registry();
        let counter = registry.register_counter("app", "hits_total", "Hits", &[]).unwrap();
        counter.inc(&[]).await.unwrap();

        registry.wipe_storage().await.unwrap();
        assert_eq!(registry.render().await.unwrap(), "");

        registry.get_counter("app", "hits_total").unwrap().inc(&[]).await.unwrap();
        assert!(registry.render().await.unwrap().ends_with("app_hits_total 1\n"));
    }
}
