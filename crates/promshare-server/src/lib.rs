pub mod api_metrics;
pub mod error;
pub mod handlers;
pub mod router;

pub use api_metrics::ApiMetrics;
pub use router::{ExporterState, exporter_router};
