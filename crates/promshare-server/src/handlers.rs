use std::{sync::Arc, time::Instant};

use axum::{
    Json,
    body::Body,
    extract::{Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use promshare_metrics::CONTENT_TYPE;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::ApiError;
use crate::router::ExporterState;

pub async fn prometheus_metrics(
    State(state): State<Arc<ExporterState>>,
) -> Result<Response, ApiError> {
    let payload = state.registry.render().await?;

    let mut response = Response::new(Body::from(payload));
    *response.status_mut() = StatusCode::OK;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE));

    Ok(response)
}

pub async fn wipe_metrics(State(state): State<Arc<ExporterState>>) -> Result<StatusCode, ApiError> {
    state.registry.wipe_storage().await?;
    info!(backend = state.registry.adapter().backend_name(), "metric storage wiped");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    backend: &'static str,
}

pub async fn health(State(state): State<Arc<ExporterState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        backend: state.registry.adapter().backend_name(),
    })
}

pub async fn track_api_metrics(
    State(state): State<Arc<ExporterState>>,
    request: Request,
    next: Next,
) -> Response {
    let started_at = Instant::now();
    let method = request.method().as_str().to_string();

    let response = next.run(request).await;
    let status = response.status().as_u16();
    if let Err(err) = state
        .api_metrics
        .record_request(&method, status, started_at.elapsed())
        .await
    {
        warn!(error = %err, method = %method, status, "failed to record request metrics");
    }

    response
}
