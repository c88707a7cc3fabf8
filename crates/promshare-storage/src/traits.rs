use async_trait::async_trait;
use chrono::{DateTime, Utc};
use promshare_common::error::Result;
use promshare_common::types::{CollectedSample, GaugeOp, Identity, MetricDescriptor};

/// Durable, multi-process aggregation of metric samples.
///
/// Every method may be called concurrently from any number of processes that
/// share the same backing store. Updates either apply exactly once or return
/// an error; they are never dropped.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Current time as seen by this adapter; used to stamp and expire summary
    /// observations.
    fn now(&self) -> DateTime<Utc>;

    async fn update_counter(
        &self,
        descriptor: &MetricDescriptor,
        identity: &Identity,
        delta: f64,
    ) -> Result<()>;

    async fn update_gauge(
        &self,
        descriptor: &MetricDescriptor,
        identity: &Identity,
        op: GaugeOp,
        value: f64,
    ) -> Result<()>;

    async fn update_histogram(
        &self,
        descriptor: &MetricDescriptor,
        identity: &Identity,
        observed: f64,
    ) -> Result<()>;

    async fn update_summary(
        &self,
        descriptor: &MetricDescriptor,
        identity: &Identity,
        observed: f64,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Every stored sample. Each sample is internally consistent; samples of
    /// different identities may reflect different instants.
    async fn collect(&self) -> Result<Vec<CollectedSample>>;

    async fn wipe_storage(&self) -> Result<()>;
}
