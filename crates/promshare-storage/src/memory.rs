use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use promshare_common::error::{PromshareError, Result};
use promshare_common::time::{Clock, SystemClock};
use promshare_common::types::{CollectedSample, GaugeOp, Identity, MetricDescriptor};
use tracing::warn;

use crate::key::{encode_sample_key, metric_key};
use crate::record::{AggregateRecord, Mutation};
use crate::traits::Adapter;

#[derive(Default)]
struct MemoryState {
    descriptors: HashMap<String, Arc<MetricDescriptor>>,
    samples: HashMap<Identity, AggregateRecord>,
}

/// Single-process adapter. Every mutation runs under one write lock, which
/// makes it the reference behaviour the shared backends are tested against.
pub struct MemoryAdapter {
    state: RwLock<MemoryState>,
    clock: Arc<dyn Clock>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn mutate(
        &self,
        descriptor: &MetricDescriptor,
        identity: &Identity,
        mutation: Mutation,
    ) -> Result<()> {
        let mut state = self.state_write()?;
        state
            .descriptors
            .entry(metric_key(&descriptor.namespace, &descriptor.name))
            .or_insert_with(|| Arc::new(descriptor.clone()));

        state
            .samples
            .entry(identity.clone())
            .or_insert_with(|| AggregateRecord::zero(descriptor))
            .apply(descriptor, mutation)
            .map_err(|reason| PromshareError::CorruptRecord {
                key: encode_sample_key(identity),
                reason,
            })
    }

    fn state_read(&self) -> Result<std::sync::RwLockReadGuard<'_, MemoryState>> {
        self.state
            .read()
            .map_err(|_| PromshareError::InternalError("memory adapter lock poisoned".to_string()))
    }

    fn state_write(&self) -> Result<std::sync::RwLockWriteGuard<'_, MemoryState>> {
        self.state
            .write()
            .map_err(|_| PromshareError::InternalError("memory adapter lock poisoned".to_string()))
    }
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Adapter for MemoryAdapter {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn update_counter(
        &self,
        descriptor: &MetricDescriptor,
        identity: &Identity,
        delta: f64,
    ) -> Result<()> {
        self.mutate(descriptor, identity, Mutation::Counter(delta))
    }

    async fn update_gauge(
        &self,
        descriptor: &MetricDescriptor,
        identity: &Identity,
        op: GaugeOp,
        value: f64,
    ) -> Result<()> {
        self.mutate(descriptor, identity, Mutation::Gauge(op, value))
    }

    async fn update_histogram(
        &self,
        descriptor: &MetricDescriptor,
        identity: &Identity,
        observed: f64,
    ) -> Result<()> {
        self.mutate(descriptor, identity, Mutation::Histogram(observed))
    }

    async fn update_summary(
        &self,
        descriptor: &MetricDescriptor,
        identity: &Identity,
        observed: f64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.mutate(
            descriptor,
            identity,
            Mutation::Summary {
                value: observed,
                at: now,
            },
        )
    }

    async fn collect(&self) -> Result<Vec<CollectedSample>> {
        let now = self.now();
        let state = self.state_read()?;

        let mut samples = Vec::with_capacity(state.samples.len());
        for (identity, record) in &state.samples {
            let Some(descriptor) = state
                .descriptors
                .get(&metric_key(&identity.namespace, &identity.name))
            else {
                continue;
            };
            match record.to_value(descriptor, now) {
                Ok(value) => samples.push(CollectedSample {
                    descriptor: Arc::clone(descriptor),
                    identity: identity.clone(),
                    value,
                }),
                Err(reason) => warn!(
                    key = %encode_sample_key(identity),
                    reason = %reason,
                    "skipping unreadable aggregate"
                ),
            }
        }

        Ok(samples)
    }

    async fn wipe_storage(&self) -> Result<()> {
        let mut state = self.state_write()?;
        state.descriptors.clear();
        state.samples.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use promshare_common::types::AggregateValue;

    use super::*;

    #[tokio::test]
    async fn gauge_keeps_last_write() {
        let adapter = MemoryAdapter::new();
        let descriptor = MetricDescriptor::gauge("", "queue_depth", "Depth", &[]).unwrap();
        let identity = descriptor.identity(&[]).unwrap();

        adapter
            .update_gauge(&descriptor, &identity, GaugeOp::Set, 234.0)
            .await
            .unwrap();
        adapter
            .update_gauge(&descriptor, &identity, GaugeOp::Set, 123.0)
            .await
            .unwrap();

        let samples = adapter.collect().await.unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].value, AggregateValue::Gauge(123.0));
    }

    #[tokio::test]
    async fn incompatible_descriptor_is_rejected() {
        let adapter = MemoryAdapter::new();
        let first = MetricDescriptor::histogram("", "latency", "help", &[], &[1.0]).unwrap();
        let second = MetricDescriptor::histogram("", "latency", "help", &[], &[1.0, 2.0]).unwrap();
        let identity = first.identity(&[]).unwrap();

        adapter
            .update_histogram(&first, &identity, 0.5)
            .await
            .unwrap();
        let err = adapter
            .update_histogram(&second, &identity, 0.5)
            .await
            .unwrap_err();
        assert!(matches!(err, PromshareError::CorruptRecord { .. }));
    }

    #[tokio::test]
    async fn wipe_clears_everything() {
        let adapter = MemoryAdapter::new();
        let descriptor = MetricDescriptor::counter("", "jobs_total", "Jobs", &["queue"]).unwrap();
        adapter
            .update_counter(&descriptor, &descriptor.identity(&["default"]).unwrap(), 3.0)
            .await
            .unwrap();

        adapter.wipe_storage().await.unwrap();
        assert!(adapter.collect().await.unwrap().is_empty());
    }
}
