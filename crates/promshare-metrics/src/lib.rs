//! Metric registration and Prometheus exposition over a shared
//! [`Adapter`](promshare_storage::Adapter).

pub mod metric;
pub mod registry;
pub mod render;

pub use metric::{Counter, Gauge, Histogram, Summary};
pub use registry::MetricsRegistry;
pub use render::{CONTENT_TYPE, render};
