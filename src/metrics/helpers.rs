//! Metrics helper structs for convenient metric recording

use prometheus::{Encoder, TextEncoder};

use super::{
    EVENTS_DELIVERED_TOTAL, EVENTS_DROPPED_TOTAL, LOOKUP_CACHE_HITS_TOTAL,
    LOOKUP_CACHE_MISSES_TOTAL, LOOKUP_LATENCY_MS, LOOKUP_NOT_FOUND_TOTAL, PRESENCE_EXPIRED_TOTAL,
    PRESENCE_TRACK_FAILURES_TOTAL, RECONNECT_ATTEMPTS_TOTAL, RECONNECT_EXHAUSTED_TOTAL,
    STATE_TRANSITIONS_TOTAL, SUBSCRIPTIONS_ACTIVE,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Helper struct for recording connection metrics
pub struct ConnectionMetrics;

impl ConnectionMetrics {
    pub fn subscription_opened() {
        SUBSCRIPTIONS_ACTIVE.inc();
    }

    pub fn subscription_closed() {
        SUBSCRIPTIONS_ACTIVE.dec();
    }

    pub fn record_transition(state: &str) {
        STATE_TRANSITIONS_TOTAL.with_label_values(&[state]).inc();
    }

    pub fn record_reconnect_attempt() {
        RECONNECT_ATTEMPTS_TOTAL.inc();
    }

    pub fn record_exhausted() {
        RECONNECT_EXHAUSTED_TOTAL.inc();
    }
}

/// Helper struct for recording routing metrics
pub struct RoutingMetrics;

impl RoutingMetrics {
    pub fn record_delivered(entity: &str) {
        EVENTS_DELIVERED_TOTAL.with_label_values(&[entity]).inc();
    }

    pub fn record_dropped(reason: &str) {
        EVENTS_DROPPED_TOTAL.with_label_values(&[reason]).inc();
    }
}

/// Helper struct for recording tenant lookup metrics
pub struct LookupMetrics;

impl LookupMetrics {
    pub fn record_cache_hit() {
        LOOKUP_CACHE_HITS_TOTAL.inc();
    }

    pub fn record_cache_miss() {
        LOOKUP_CACHE_MISSES_TOTAL.inc();
    }

    pub fn record_not_found() {
        LOOKUP_NOT_FOUND_TOTAL.inc();
    }

    pub fn record_latency_ms(latency_ms: u64) {
        LOOKUP_LATENCY_MS.observe(latency_ms as f64);
    }
}

/// Helper struct for recording presence metrics
pub struct PresenceMetrics;

impl PresenceMetrics {
    pub fn record_track_failure() {
        PRESENCE_TRACK_FAILURES_TOTAL.inc();
    }

    pub fn record_expired(count: u64) {
        PRESENCE_EXPIRED_TOTAL.inc_by(count);
    }
}
