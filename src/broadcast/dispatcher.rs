use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::connection_manager::{CloseReason, ConnectionManager, OverflowPolicy};
use crate::metrics::BroadcastMetrics;
use crate::websocket::{ChatMessage, MessageCodec};

/// Outcome of fanning one message out to the registry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    /// Connections present in the snapshot (one enqueue attempt each)
    pub targeted: usize,
    /// Connections whose queue accepted the frame
    pub enqueued: usize,
    /// Connections that dropped a frame to make room or rejected this one
    pub dropped: usize,
    /// Connections closed by this broadcast for overflowing too often
    pub forced_closures: usize,
}

/// Statistics for the broadcast dispatcher
#[derive(Debug, Default)]
pub struct DispatcherStats {
    pub total_broadcasts: AtomicU64,
    pub total_enqueued: AtomicU64,
    pub total_dropped: AtomicU64,
    pub forced_closures: AtomicU64,
}

impl DispatcherStats {
    pub fn snapshot(&self) -> DispatcherStatsSnapshot {
        DispatcherStatsSnapshot {
            total_broadcasts: self.total_broadcasts.load(Ordering::Relaxed),
            total_enqueued: self.total_enqueued.load(Ordering::Relaxed),
            total_dropped: self.total_dropped.load(Ordering::Relaxed),
            forced_closures: self.forced_closures.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of dispatcher statistics
#[derive(Debug, Clone, Serialize)]
pub struct DispatcherStatsSnapshot {
    pub total_broadcasts: u64,
    pub total_enqueued: u64,
    pub total_dropped: u64,
    pub forced_closures: u64,
}

/// Fans messages out to every registered connection
pub struct BroadcastDispatcher {
    connection_manager: Arc<ConnectionManager>,
    /// Dropped frames after which a connection is force-closed (0 = never)
    overflow_close_threshold: u64,
    /// Held for one whole fan-out so concurrent callers cannot interleave
    fanout: Mutex<()>,
    stats: DispatcherStats,
}

impl BroadcastDispatcher {
    pub fn new(connection_manager: Arc<ConnectionManager>, overflow_close_threshold: u64) -> Self {
        Self {
            connection_manager,
            overflow_close_threshold,
            fanout: Mutex::new(()),
            stats: DispatcherStats::default(),
        }
    }

    /// Get dispatcher statistics
    pub fn stats(&self) -> DispatcherStatsSnapshot {
        self.stats.snapshot()
    }

    /// Encode `message` once and enqueue it on every connection in a registry snapshot.
    ///
    /// Never blocks and never fails as a whole: a full queue only affects its own
    /// connection, which is marked degraded and may be force-closed.
    ///
    /// Calls are serialized, so every connection sees concurrent broadcasts in the
    /// same order. The lock is held for one snapshot and one enqueue per handle.
    pub fn broadcast(&self, message: &ChatMessage) -> BroadcastReport {
        let frame = MessageCodec::encode(message);
        let fanout = self.fanout.lock().unwrap_or_else(PoisonError::into_inner);
        let connections = self.connection_manager.snapshot();

        let mut report = BroadcastReport {
            targeted: connections.len(),
            ..Default::default()
        };

        for handle in &connections {
            match handle.enqueue(frame.clone()) {
                Ok(()) => report.enqueued += 1,
                Err(overflow) => {
                    report.dropped += 1;
                    if overflow.policy == OverflowPolicy::DropOldest {
                        report.enqueued += 1;
                    }

                    tracing::debug!(
                        connection_id = %handle.id,
                        dropped_total = overflow.dropped_total,
                        "Outbound queue overflow"
                    );

                    if self.overflow_close_threshold > 0
                        && overflow.dropped_total >= self.overflow_close_threshold
                        && handle.close(CloseReason::SlowConsumer)
                    {
                        report.forced_closures += 1;
                        BroadcastMetrics::record_forced_closure();
                        tracing::warn!(
                            connection_id = %handle.id,
                            display_name = %handle.display_name,
                            dropped_total = overflow.dropped_total,
                            threshold = self.overflow_close_threshold,
                            "Forcing closure of slow connection"
                        );
                    }
                }
            }
        }

        drop(fanout);

        self.stats.total_broadcasts.fetch_add(1, Ordering::Relaxed);
        self.stats
            .total_enqueued
            .fetch_add(report.enqueued as u64, Ordering::Relaxed);
        self.stats
            .total_dropped
            .fetch_add(report.dropped as u64, Ordering::Relaxed);
        self.stats
            .forced_closures
            .fetch_add(report.forced_closures as u64, Ordering::Relaxed);
        BroadcastMetrics::record_broadcast(
            report.targeted,
            report.enqueued as u64,
            report.dropped as u64,
        );

        tracing::debug!(
            sender = %message.sender(),
            targeted = report.targeted,
            enqueued = report.enqueued,
            dropped = report.dropped,
            "Broadcast message"
        );

        report
    }
}

#[derive(Debug, Clone, Error)]
#[error("Dispatcher is no longer accepting messages")]
pub struct DispatcherClosed;

/// Submits inbound messages to the dispatch task.
///
/// The inbox order is the global arrival order, so every connection sees
/// broadcasts in the same relative order.
#[derive(Clone)]
pub struct DispatchHandle {
    tx: mpsc::Sender<ChatMessage>,
}

impl DispatchHandle {
    /// Waits while the inbox is full; fails once the dispatch task has stopped.
    pub async fn submit(&self, message: ChatMessage) -> Result<(), DispatcherClosed> {
        self.tx.send(message).await.map_err(|_| DispatcherClosed)
    }
}

/// Start the single task that drains the inbox into [`BroadcastDispatcher::broadcast`].
///
/// On cancellation, messages already accepted into the inbox are still broadcast
/// before the task exits.
pub fn spawn_dispatch_loop(
    dispatcher: Arc<BroadcastDispatcher>,
    buffer: usize,
    shutdown: CancellationToken,
) -> (DispatchHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<ChatMessage>(buffer.max(1));

    let task = tokio::spawn(async move {
        tracing::info!(buffer = buffer, "Dispatch loop started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                message = rx.recv() => match message {
                    Some(message) => {
                        dispatcher.broadcast(&message);
                    }
                    None => break,
                },
            }
        }

        rx.close();
        let mut flushed = 0usize;
        while let Ok(message) = rx.try_recv() {
            dispatcher.broadcast(&message);
            flushed += 1;
        }

        tracing::info!(flushed = flushed, "Dispatch loop stopped");
    });

    (DispatchHandle { tx }, task)
}
