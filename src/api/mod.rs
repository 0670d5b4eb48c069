//! HTTP API layer
//!
//! Only the federation surface is served here: ActivityPub endpoints,
//! WebFinger discovery, and the metrics scrape target.

mod activitypub;
mod wellknown;

pub use activitypub::activitypub_router;
pub use wellknown::wellknown_router;

use axum::{Router, routing::get};

/// Router for the Prometheus scrape endpoint.
pub fn metrics_router() -> Router {
    Router::new().route("/metrics", get(metrics))
}

async fn metrics() -> String {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let metric_families = crate::metrics::REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
