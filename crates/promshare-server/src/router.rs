use std::sync::Arc;

use axum::{Router, middleware, routing::get};
use promshare_common::error::Result;
use promshare_metrics::MetricsRegistry;

use crate::{api_metrics::ApiMetrics, handlers};

pub struct ExporterState {
    pub registry: Arc<MetricsRegistry>,
    pub api_metrics: Arc<ApiMetrics>,
}

impl ExporterState {
    pub fn new(registry: Arc<MetricsRegistry>, namespace: &str) -> Result<Self> {
        let api_metrics = Arc::new(ApiMetrics::register(registry.as_ref(), namespace)?);
        Ok(Self {
            registry,
            api_metrics,
        })
    }
}

pub fn exporter_router(state: Arc<ExporterState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/metrics",
            get(handlers::prometheus_metrics).delete(handlers::wipe_metrics),
        )
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            handlers::track_api_metrics,
        ))
        .with_state(state)
}
