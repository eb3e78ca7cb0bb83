//! Prometheus metrics for the broadcaster.
//!
//! - Connection metrics (active connections, opened/closed by reason, duration)
//! - Inbound metrics (messages accepted, decode errors)
//! - Fan-out metrics (broadcasts, frames enqueued/dropped, forced closures)

mod helpers;

pub use helpers::{encode_metrics, BroadcastMetrics, ConnectionMetrics, InboundMetrics};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "planthub";

lazy_static! {
    // ============================================================================
    // Connection Metrics
    // ============================================================================

    /// Number of connections currently registered
    pub static ref CONNECTIONS_ACTIVE: IntGauge = register_int_gauge!(
        format!("{}_connections_active", METRIC_PREFIX),
        "Number of connections currently registered"
    ).unwrap();

    /// Total connections admitted
    pub static ref CONNECTIONS_OPENED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_connections_opened_total", METRIC_PREFIX),
        "Total connections admitted"
    ).unwrap();

    /// Total connections closed, by reason
    pub static ref CONNECTIONS_CLOSED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_connections_closed_total", METRIC_PREFIX),
        "Total connections closed",
        &["reason"]
    ).unwrap();

    /// Connection lifetime
    pub static ref CONNECTION_DURATION: Histogram = register_histogram!(
        format!("{}_connection_duration_seconds", METRIC_PREFIX),
        "Connection duration in seconds",
        vec![1.0, 10.0, 60.0, 300.0, 900.0, 3600.0, 14400.0]
    ).unwrap();

    // ============================================================================
    // Inbound Metrics
    // ============================================================================

    /// Messages decoded and handed to the dispatcher
    pub static ref MESSAGES_RECEIVED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_messages_received_total", METRIC_PREFIX),
        "Total inbound messages accepted for broadcast"
    ).unwrap();

    /// Inbound frames discarded because they could not be decoded
    pub static ref DECODE_ERRORS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_decode_errors_total", METRIC_PREFIX),
        "Total inbound frames dropped as malformed"
    ).unwrap();

    // ============================================================================
    // Fan-out Metrics
    // ============================================================================

    /// Broadcasts performed
    pub static ref BROADCASTS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_broadcasts_total", METRIC_PREFIX),
        "Total broadcasts performed"
    ).unwrap();

    /// Frames placed on outbound queues
    pub static ref FRAMES_ENQUEUED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_frames_enqueued_total", METRIC_PREFIX),
        "Total frames placed on outbound queues"
    ).unwrap();

    /// Frames lost to outbound queue overflow
    pub static ref FRAMES_DROPPED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_frames_dropped_total", METRIC_PREFIX),
        "Total frames dropped due to a full outbound queue"
    ).unwrap();

    /// Slow connections closed by the dispatcher
    pub static ref FORCED_CLOSURES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_forced_closures_total", METRIC_PREFIX),
        "Total connections force-closed after repeated queue overflow"
    ).unwrap();

    /// Recipients per broadcast
    pub static ref BROADCAST_FANOUT: Histogram = register_histogram!(
        format!("{}_broadcast_fanout", METRIC_PREFIX),
        "Number of connections targeted by one broadcast",
        vec![0.0, 1.0, 2.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0]
    ).unwrap();
}
