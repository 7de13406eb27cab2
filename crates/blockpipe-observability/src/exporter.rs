//! Scrape and probe endpoints.
//!
//! - `/metrics`: everything in [`REGISTRY`], Prometheus text format
//! - `/health`: 200 while the process is up
//! - `/ready`: 200 while the readiness check passes, 503 otherwise. The
//!   indexer reports not-ready while the RPC circuit breaker is open.

use crate::metrics::REGISTRY;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;

/// Reports whether the process can currently make progress.
pub type ReadinessCheck = Arc<dyn Fn() -> bool + Send + Sync>;

async fn metrics_handler() -> Response {
    let encoder = TextEncoder::new();
    let mut body = Vec::with_capacity(16 * 1024);
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut body) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("encoding metrics: {}", e),
        )
            .into_response();
    }
    (
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        body,
    )
        .into_response()
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn ready_handler(State(ready): State<ReadinessCheck>) -> Response {
    if ready() {
        "ready".into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "upstream unavailable").into_response()
    }
}

/// Router serving the three endpoints. Without a readiness check `/ready`
/// always succeeds.
pub fn create_metrics_router(readiness: Option<ReadinessCheck>) -> Router {
    let readiness = readiness.unwrap_or_else(|| Arc::new(|| true));
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .with_state(readiness)
}
