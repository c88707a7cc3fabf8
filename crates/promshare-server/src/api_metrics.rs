use std::time::Duration;

use promshare_common::error::Result;
use promshare_metrics::{Counter, Histogram, MetricsRegistry};

/// Request metrics for the exporter's own HTTP surface.
pub struct ApiMetrics {
    requests_total: Counter,
    request_duration_seconds: Histogram,
}

impl ApiMetrics {
    pub fn register(registry: &MetricsRegistry, namespace: &str) -> Result<Self> {
        let requests_total = registry.register_counter(
            namespace,
            "http_requests_total",
            "Total number of exporter HTTP requests",
            &["method", "status"],
        )?;

        let request_duration_seconds = registry.register_histogram(
            namespace,
            "http_request_duration_seconds",
            "Duration of exporter HTTP requests in seconds",
            &["method", "status"],
            &[],
        )?;

        Ok(Self {
            requests_total,
            request_duration_seconds,
        })
    }

    pub async fn record_request(
        &self,
        method: &str,
        status: u16,
        duration: Duration,
    ) -> Result<()> {
        let status_value = status.to_string();
        let labels = [method, status_value.as_str()];
        self.requests_total.inc(&labels).await?;
        self.request_duration_seconds
            .observe(&labels, duration.as_secs_f64())
            .await
    }
}
