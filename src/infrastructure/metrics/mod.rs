//! Prometheus Metrics Module
//!
//! Provides application-wide metrics collection using Prometheus.
//!
//! # Metrics Collected
//! - Active WebSocket connection gauge
//! - Routed messages by routing mode and outcome
//! - Bus publishes by topic and result, bus records consumed
//! - Presence cache failures by operation
//! - Disconnects caused by outbound queue overflow

use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

/// Live connections registered in the hub
pub static CONNECTIONS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::with_opts(
        Opts::new("connections_active", "Number of live WebSocket connections").namespace("chat_relay"),
    )
    .expect("Failed to create CONNECTIONS_ACTIVE metric")
});

/// Messages handed to the router
pub static MESSAGES_ROUTED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("messages_routed_total", "Messages dispatched by the router").namespace("chat_relay"),
        &["mode", "outcome"],
    )
    .expect("Failed to create MESSAGES_ROUTED_TOTAL metric")
});

/// Bus appends by topic and result
pub static BUS_PUBLISH_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("bus_publish_total", "Records appended to the message bus").namespace("chat_relay"),
        &["topic", "result"], // "ok", "retry", "dropped"
    )
    .expect("Failed to create BUS_PUBLISH_TOTAL metric")
});

/// Bus records read by the consumer loops
pub static BUS_RECORDS_CONSUMED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("bus_records_consumed_total", "Records consumed from the message bus")
            .namespace("chat_relay"),
        &["topic", "result"], // "delivered", "expired", "undecodable"
    )
    .expect("Failed to create BUS_RECORDS_CONSUMED_TOTAL metric")
});

/// Presence cache failures
pub static PRESENCE_FAILURES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("presence_failures_total", "Failed presence cache operations").namespace("chat_relay"),
        &["operation"],
    )
    .expect("Failed to create PRESENCE_FAILURES_TOTAL metric")
});

/// Connections closed because their outbound queue was full
pub static QUEUE_OVERFLOW_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::with_opts(
        Opts::new(
            "queue_overflow_disconnects_total",
            "Connections closed on outbound queue overflow",
        )
        .namespace("chat_relay"),
    )
    .expect("Failed to create QUEUE_OVERFLOW_TOTAL metric")
});

/// Register all metrics with the registry
fn register_metrics(registry: &Registry) {
    registry
        .register(Box::new(CONNECTIONS_ACTIVE.clone()))
        .expect("Failed to register CONNECTIONS_ACTIVE");
    registry
        .register(Box::new(MESSAGES_ROUTED_TOTAL.clone()))
        .expect("Failed to register MESSAGES_ROUTED_TOTAL");
    registry
        .register(Box::new(BUS_PUBLISH_TOTAL.clone()))
        .expect("Failed to register BUS_PUBLISH_TOTAL");
    registry
        .register(Box::new(BUS_RECORDS_CONSUMED_TOTAL.clone()))
        .expect("Failed to register BUS_RECORDS_CONSUMED_TOTAL");
    registry
        .register(Box::new(PRESENCE_FAILURES_TOTAL.clone()))
        .expect("Failed to register PRESENCE_FAILURES_TOTAL");
    registry
        .register(Box::new(QUEUE_OVERFLOW_TOTAL.clone()))
        .expect("Failed to register QUEUE_OVERFLOW_TOTAL");
}

/// Collect and encode all metrics as Prometheus text format
pub fn gather_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

/// Helper to update the live connection gauge
pub fn set_connections(count: usize) {
    CONNECTIONS_ACTIVE.set(count as i64);
}

/// Helper to record a router dispatch
pub fn record_routed(mode: &str, outcome: &str) {
    MESSAGES_ROUTED_TOTAL.with_label_values(&[mode, outcome]).inc();
}

/// Helper to record a bus append attempt
pub fn record_bus_publish(topic: &str, result: &str) {
    BUS_PUBLISH_TOTAL.with_label_values(&[topic, result]).inc();
}

/// Helper to record a consumed bus record
pub fn record_bus_consumed(topic: &str, result: &str) {
    BUS_RECORDS_CONSUMED_TOTAL.with_label_values(&[topic, result]).inc();
}

/// Helper to record a presence cache failure
pub fn record_presence_failure(operation: &str) {
    PRESENCE_FAILURES_TOTAL.with_label_values(&[operation]).inc();
}

pub fn record_queue_overflow() {
    QUEUE_OVERFLOW_TOTAL.inc();
}
