//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, IntCounterVec, IntGauge, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Federation Metrics
    pub static ref ACTIVITIES_RECEIVED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("driftway_activities_received_total", "Total number of ActivityPub activities received"),
        &["activity_type"]
    ).expect("metric can be created");
    pub static ref ACTIVITIES_SENT_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("driftway_activities_sent_total", "Total number of ActivityPub activities sent"),
        &["activity_type"]
    ).expect("metric can be created");
    pub static ref FEDERATION_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("driftway_federation_requests_total", "Total number of federation requests"),
        &["direction", "status"]
    ).expect("metric can be created");
    pub static ref FEDERATION_REQUEST_DURATION_SECONDS: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new(
            "driftway_federation_request_duration_seconds",
            "Federation request duration in seconds"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["direction"]
    ).expect("metric can be created");

    // Delivery Metrics
    pub static ref DELIVERY_ATTEMPTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("driftway_delivery_attempts_total", "Total number of outbound delivery attempts"),
        &["status"]
    ).expect("metric can be created");
    pub static ref DELIVERY_QUEUE_DEPTH: IntGauge = IntGauge::new(
        "driftway_delivery_queue_depth",
        "Current number of queued delivery jobs"
    ).expect("metric can be created");
    pub static ref RELAYS_ACCEPTED: IntGauge = IntGauge::new(
        "driftway_relays_accepted",
        "Current number of relays in the accepted state"
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("driftway_errors_total", "Total number of errors"),
        &["error_type"]
    ).expect("metric can be created");
}

/// Initialize metrics registry.
pub fn init_metrics() {
    REGISTRY
        .register(Box::new(ACTIVITIES_RECEIVED_TOTAL.clone()))
        .expect("ACTIVITIES_RECEIVED_TOTAL can be registered");
    REGISTRY
        .register(Box::new(ACTIVITIES_SENT_TOTAL.clone()))
        .expect("ACTIVITIES_SENT_TOTAL can be registered");
    REGISTRY
        .register(Box::new(FEDERATION_REQUESTS_TOTAL.clone()))
        .expect("FEDERATION_REQUESTS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(FEDERATION_REQUEST_DURATION_SECONDS.clone()))
        .expect("FEDERATION_REQUEST_DURATION_SECONDS can be registered");
    REGISTRY
        .register(Box::new(DELIVERY_ATTEMPTS_TOTAL.clone()))
        .expect("DELIVERY_ATTEMPTS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(DELIVERY_QUEUE_DEPTH.clone()))
        .expect("DELIVERY_QUEUE_DEPTH can be registered");
    REGISTRY
        .register(Box::new(RELAYS_ACCEPTED.clone()))
        .expect("RELAYS_ACCEPTED can be registered");
    REGISTRY
        .register(Box::new(ERRORS_TOTAL.clone()))
        .expect("ERRORS_TOTAL can be registered");

    tracing::info!("Metrics registry initialized");
}
