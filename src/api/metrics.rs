//! Prometheus metrics endpoint.

use axum::{http::header, response::IntoResponse};

use crate::error::{AppError, Result};
use crate::metrics;

/// GET /metrics - Prometheus metrics endpoint
pub async fn prometheus_metrics() -> Result<impl IntoResponse> {
    let output = metrics::encode_metrics().map_err(|e| {
        tracing::error!(error = %e, "Failed to encode Prometheus metrics");
        AppError::Internal(format!("Failed to encode metrics: {}", e))
    })?;

    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        output,
    ))
}
