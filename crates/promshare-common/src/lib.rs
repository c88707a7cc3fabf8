pub mod error;
pub mod time;
pub mod types;

pub use error::{PromshareError, Result};
pub use time::{Clock, ManualClock, SystemClock};
pub use types::{
    AggregateValue, CollectedSample, DEFAULT_BUCKETS, DEFAULT_MAX_AGE_SECONDS, DEFAULT_QUANTILES,
    GaugeOp, HistogramConfig, Identity, KindConfig, MetricDescriptor, MetricKind, SummaryConfig,
    exponential_buckets, linear_buckets,
};
