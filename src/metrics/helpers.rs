//! Metrics helper structs for convenient metric recording

use prometheus::{Encoder, TextEncoder};

use super::{
    BROADCASTS_TOTAL, BROADCAST_FANOUT, CONNECTIONS_ACTIVE, CONNECTIONS_CLOSED_TOTAL,
    CONNECTIONS_OPENED_TOTAL, CONNECTION_DURATION, DECODE_ERRORS_TOTAL, FORCED_CLOSURES_TOTAL,
    FRAMES_DROPPED_TOTAL, FRAMES_ENQUEUED_TOTAL, MESSAGES_RECEIVED_TOTAL,
};
use crate::connection_manager::CloseReason;

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Helper struct for recording connection lifecycle metrics
pub struct ConnectionMetrics;

impl ConnectionMetrics {
    pub fn record_opened() {
        CONNECTIONS_OPENED_TOTAL.inc();
        CONNECTIONS_ACTIVE.inc();
    }

    pub fn record_closed(reason: CloseReason, duration_secs: f64) {
        CONNECTIONS_ACTIVE.dec();
        CONNECTIONS_CLOSED_TOTAL
            .with_label_values(&[reason.as_str()])
            .inc();
        CONNECTION_DURATION.observe(duration_secs);
    }
}

/// Helper struct for recording inbound frame metrics
pub struct InboundMetrics;

impl InboundMetrics {
    pub fn record_received() {
        MESSAGES_RECEIVED_TOTAL.inc();
    }

    pub fn record_decode_error() {
        DECODE_ERRORS_TOTAL.inc();
    }
}

/// Helper struct for recording fan-out metrics
pub struct BroadcastMetrics;

impl BroadcastMetrics {
    pub fn record_broadcast(targeted: usize, enqueued: u64, dropped: u64) {
        BROADCASTS_TOTAL.inc();
        BROADCAST_FANOUT.observe(targeted as f64);
        FRAMES_ENQUEUED_TOTAL.inc_by(enqueued);
        FRAMES_DROPPED_TOTAL.inc_by(dropped);
    }

    pub fn record_forced_closure() {
        FORCED_CLOSURES_TOTAL.inc();
    }
}
