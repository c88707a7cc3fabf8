use std::sync::Arc;

use promshare_common::error::{PromshareError, Result};
use promshare_common::types::{GaugeOp, MetricDescriptor};
use promshare_storage::traits::Adapter;

/// Handles hold no aggregate state: every call is forwarded to the adapter.
#[derive(Clone)]
pub struct Counter {
    descriptor: Arc<MetricDescriptor>,
    adapter: Arc<dyn Adapter>,
}

impl Counter {
    pub(crate) fn new(descriptor: Arc<MetricDescriptor>, adapter: Arc<dyn Adapter>) -> Self {
        Self {
            descriptor,
            adapter,
        }
    }

    pub fn descriptor(&self) -> &MetricDescriptor {
        &self.descriptor
    }

    pub async fn inc(&self, labels: &[&str]) -> Result<()> {
        self.inc_by(labels, 1.0).await
    }

    pub async fn inc_by(&self, labels: &[&str], delta: f64) -> Result<()> {
        if !delta.is_finite() || delta < 0.0 {
            return Err(PromshareError::InvalidArgument(format!(
                "counter {} can only increase, got delta {delta}",
                self.descriptor.full_name()
            )));
        }
        let identity = self.descriptor.identity(labels)?;
        self.adapter
            .update_counter(&self.descriptor, &identity, delta)
            .await
    }
}

#[derive(Clone)]
pub struct Gauge {
    descriptor: Arc<MetricDescriptor>,
    adapter: Arc<dyn Adapter>,
}

impl Gauge {
    pub(crate) fn new(descriptor: Arc<MetricDescriptor>, adapter: Arc<dyn Adapter>) -> Self {
        Self {
            descriptor,
            adapter,
        }
    }

    pub fn descriptor(&self) -> &MetricDescriptor {
        &self.descriptor
    }

    pub async fn set(&self, labels: &[&str], value: f64) -> Result<()> {
        self.update(labels, GaugeOp::Set, value).await
    }

    pub async fn inc(&self, labels: &[&str]) -> Result<()> {
        self.update(labels, GaugeOp::Increment, 1.0).await
    }

    pub async fn inc_by(&self, labels: &[&str], value: f64) -> Result<()> {
        self.update(labels, GaugeOp::Increment, value).await
    }

    pub async fn dec(&self, labels: &[&str]) -> Result<()> {
        self.update(labels, GaugeOp::Decrement, 1.0).await
    }

    pub async fn dec_by(&self, labels: &[&str], value: f64) -> Result<()> {
        self.update(labels, GaugeOp::Decrement, value).await
    }

    async fn update(&self, labels: &[&str], op: GaugeOp, value: f64) -> Result<()> {
        reject_nan(&self.descriptor, value)?;
        let identity = self.descriptor.identity(labels)?;
        self.adapter
            .update_gauge(&self.descriptor, &identity, op, value)
            .await
    }
}

#[derive(Clone)]
pub struct Histogram {
    descriptor: Arc<MetricDescriptor>,
    adapter: Arc<dyn Adapter>,
}

impl Histogram {
    pub(crate) fn new(descriptor: Arc<MetricDescriptor>, adapter: Arc<dyn Adapter>) -> Self {
        Self {
            descriptor,
            adapter,
        }
    }

    pub fn descriptor(&self) -> &MetricDescriptor {
        &self.descriptor
    }

    pub async fn observe(&self, labels: &[&str], value: f64) -> Result<()> {
        reject_nan(&self.descriptor, value)?;
        let identity = self.descriptor.identity(labels)?;
        self.adapter
            .update_histogram(&self.descriptor, &identity, value)
            .await
    }
}

#[derive(Clone)]
pub struct Summary {
    descriptor: Arc<MetricDescriptor>,
    adapter: Arc<dyn Adapter>,
}

impl Summary {
    pub(crate) fn new(descriptor: Arc<MetricDescriptor>, adapter: Arc<dyn Adapter>) -> Self {
        Self {
            descriptor,
            adapter,
        }
    }

    pub fn descriptor(&self) -> &MetricDescriptor {
        &self.descriptor
    }

    /// Records `value` stamped with the adapter's current time.
    pub async fn observe(&self, labels: &[&str], value: f64) -> Result<()> {
        reject_nan(&self.descriptor, value)?;
        let identity = self.descriptor.identity(labels)?;
        let now = self.adapter.now();
        self.adapter
            .update_summary(&self.descriptor, &identity, value, now)
            .await
    }
}

fn reject_nan(descriptor: &MetricDescriptor, value: f64) -> Result<()> {
    if value.is_nan() {
        return Err(PromshareError::InvalidArgument(format!(
            "{} does not accept NaN",
            descriptor.full_name()
        )));
    }
    Ok(())
}
