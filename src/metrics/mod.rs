//! Prometheus metrics for the real-time client.
//!
//! - Connection metrics (active subscriptions, state transitions, reconnects)
//! - Routing metrics (delivered and dropped change events)
//! - Lookup metrics (tenant cache hits/misses, backend latency)
//! - Presence metrics

mod helpers;

pub use helpers::{encode_metrics, ConnectionMetrics, LookupMetrics, PresenceMetrics, RoutingMetrics};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "ara_realtime";

lazy_static! {
    // ============================================================================
    // Connection Metrics
    // ============================================================================

    /// Live tenant subscriptions
    pub static ref SUBSCRIPTIONS_ACTIVE: IntGauge = register_int_gauge!(
        format!("{}_subscriptions_active", METRIC_PREFIX),
        "Number of live tenant subscriptions"
    ).unwrap();

    /// Connection state transitions by target state
    pub static ref STATE_TRANSITIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_state_transitions_total", METRIC_PREFIX),
        "Connection state transitions",
        &["state"]
    ).unwrap();

    /// Reconnection attempts started
    pub static ref RECONNECT_ATTEMPTS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_reconnect_attempts_total", METRIC_PREFIX),
        "Total reconnection attempts"
    ).unwrap();

    /// Subscriptions that gave up after exhausting reconnection attempts
    pub static ref RECONNECT_EXHAUSTED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_reconnect_exhausted_total", METRIC_PREFIX),
        "Subscriptions that exhausted reconnection attempts"
    ).unwrap();

    // ============================================================================
    // Routing Metrics
    // ============================================================================

    /// Change events delivered to handlers by entity type
    pub static ref EVENTS_DELIVERED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_events_delivered_total", METRIC_PREFIX),
        "Change events delivered to handlers",
        &["entity"]
    ).unwrap();

    /// Change events dropped by reason
    pub static ref EVENTS_DROPPED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_events_dropped_total", METRIC_PREFIX),
        "Change events dropped before delivery",
        &["reason"]
    ).unwrap();

    // ============================================================================
    // Lookup Metrics
    // ============================================================================

    pub static ref LOOKUP_CACHE_HITS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_lookup_cache_hits_total", METRIC_PREFIX),
        "Tenant lookups answered from cache"
    ).unwrap();

    pub static ref LOOKUP_CACHE_MISSES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_lookup_cache_misses_total", METRIC_PREFIX),
        "Tenant lookups that went to the backend"
    ).unwrap();

    pub static ref LOOKUP_NOT_FOUND_TOTAL: IntCounter = register_int_counter!(
        format!("{}_lookup_not_found_total", METRIC_PREFIX),
        "Tenant lookups whose parent record was missing"
    ).unwrap();

    /// Backend lookup latency in milliseconds
    pub static ref LOOKUP_LATENCY_MS: Histogram = register_histogram!(
        format!("{}_lookup_latency_ms", METRIC_PREFIX),
        "Backend parent lookup latency in milliseconds",
        vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0]
    ).unwrap();

    // ============================================================================
    // Presence Metrics
    // ============================================================================

    pub static ref PRESENCE_TRACK_FAILURES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_presence_track_failures_total", METRIC_PREFIX),
        "Presence track calls that failed"
    ).unwrap();

    pub static ref PRESENCE_EXPIRED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_presence_expired_total", METRIC_PREFIX),
        "Roster entries expired for missing heartbeats"
    ).unwrap();
}
