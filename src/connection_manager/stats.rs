//! Connection statistics

use serde::Serialize;

/// Point-in-time counters across every registered connection
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionStats {
    pub total_connections: usize,
    /// Connections whose outbound queue has overflowed at least once
    pub degraded_connections: usize,
    pub queued_frames: usize,
    pub dropped_frames: u64,
}
