//! Prometheus metrics endpoint.

use axum::http::header;
use axum::response::IntoResponse;

use voice_gateway_core::metrics;

/// `GET /metrics` in Prometheus exposition format.
pub async fn metrics_handler() -> impl IntoResponse {
    (
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        metrics::render_prometheus(),
    )
}
