//! Graceful shutdown handling for the broadcaster.
//!
//! This module provides coordinated shutdown functionality that:
//! 1. Closes every registered connection so its write loop flushes what is queued
//! 2. Cancels the service token, stopping admission and the dispatch task
//! 3. Waits (bounded) for connections to unregister
//! 4. Joins the dispatch task

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::ShutdownSettings;
use crate::connection_manager::{CloseReason, ConnectionManager};

/// Configuration for graceful shutdown behavior
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time to wait for connections to flush and close (default: 10 seconds)
    pub drain_timeout: Duration,
    /// Time to wait for the dispatch task to stop (default: 2 seconds)
    pub dispatcher_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(10),
            dispatcher_timeout: Duration::from_secs(2),
        }
    }
}

impl ShutdownConfig {
    pub fn from_settings(settings: &ShutdownSettings) -> Self {
        Self {
            drain_timeout: settings.drain(),
            dispatcher_timeout: settings.loop_exit(),
        }
    }
}

/// Handles graceful shutdown of the broadcaster
pub struct GracefulShutdown {
    connection_manager: Arc<ConnectionManager>,
    shutdown: CancellationToken,
    dispatch_task: Option<JoinHandle<()>>,
    config: ShutdownConfig,
}

impl GracefulShutdown {
    pub fn new(
        connection_manager: Arc<ConnectionManager>,
        shutdown: CancellationToken,
        dispatch_task: Option<JoinHandle<()>>,
        config: ShutdownConfig,
    ) -> Self {
        Self {
            connection_manager,
            shutdown,
            dispatch_task,
            config,
        }
    }

    /// Execute graceful shutdown sequence
    #[tracing::instrument(
        name = "graceful_shutdown",
        skip(self),
        fields(total_connections = self.connection_manager.len())
    )]
    pub async fn execute(self, reason: &str) -> ShutdownResult {
        let start = std::time::Instant::now();
        let mut result = ShutdownResult::default();

        // Phase 1: Close every connection
        tracing::info!(reason = %reason, "Starting graceful shutdown - Phase 1: Closing connections");
        result.connections_signalled = self.close_connections();

        // Phase 2: Stop admission, the dispatch task and any straggler
        tracing::info!("Phase 2: Cancelling service token");
        self.shutdown.cancel();

        // Phase 3: Wait for sessions to unregister
        tracing::info!("Phase 3: Waiting for connections to close");
        let (closed, remaining) = self.wait_for_connections_to_close().await;
        result.connections_closed = closed;
        result.connections_remaining = remaining;

        // Phase 4: Join the dispatch task
        tracing::info!("Phase 4: Stopping dispatcher");
        result.dispatcher_stopped = self.stop_dispatcher().await;

        result.duration = start.elapsed();
        result.success = remaining == 0 && result.dispatcher_stopped;

        tracing::info!(
            connections_signalled = result.connections_signalled,
            connections_closed = result.connections_closed,
            connections_remaining = result.connections_remaining,
            dispatcher_stopped = result.dispatcher_stopped,
            duration_ms = result.duration.as_millis(),
            "Graceful shutdown completed"
        );

        result
    }

    fn close_connections(&self) -> usize {
        self.connection_manager
            .snapshot()
            .iter()
            .filter(|handle| handle.close(CloseReason::Shutdown))
            .count()
    }

    /// Returns (closed, remaining)
    async fn wait_for_connections_to_close(&self) -> (usize, usize) {
        let initial = self.connection_manager.len();
        if initial == 0 {
            return (0, 0);
        }

        let wait_future = async {
            while !self.connection_manager.is_empty() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };

        let _ = timeout(self.config.drain_timeout, wait_future).await;

        let final_count = self.connection_manager.len();
        if final_count > 0 {
            tracing::warn!(
                remaining_connections = final_count,
                "Some connections did not close gracefully"
            );
        }

        (initial.saturating_sub(final_count), final_count)
    }

    async fn stop_dispatcher(self) -> bool {
        let Some(mut task) = self.dispatch_task else {
            return true;
        };

        match timeout(self.config.dispatcher_timeout, &mut task).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Dispatch task failed");
                false
            }
            Err(_) => {
                tracing::warn!("Dispatch task did not stop in time, aborting");
                task.abort();
                false
            }
        }
    }
}

/// Result of a graceful shutdown operation
#[derive(Debug, Default)]
pub struct ShutdownResult {
    /// Whether every connection closed and the dispatcher stopped in time
    pub success: bool,
    /// Connections that were open and told to close
    pub connections_signalled: usize,
    /// Connections that unregistered before the drain timeout
    pub connections_closed: usize,
    /// Connections still registered when the drain timeout elapsed
    pub connections_remaining: usize,
    pub dispatcher_stopped: bool,
    /// Total time taken for shutdown
    pub duration: Duration,
}
