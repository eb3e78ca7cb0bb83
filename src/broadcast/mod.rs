//! Fan-out of chat messages to every open connection.
//!
//! [`Broadcaster`] is the explicitly owned service instance: it is built once at
//! startup, handed to the HTTP layer, and torn down through
//! [`Broadcaster::shutdown`].

mod dispatcher;

use std::sync::{Arc, Mutex, PoisonError};

use futures::{Sink, Stream};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use dispatcher::{
    spawn_dispatch_loop, BroadcastDispatcher, BroadcastReport, DispatchHandle, DispatcherClosed,
    DispatcherStats, DispatcherStatsSnapshot,
};

use crate::config::Settings;
use crate::connection_manager::{ConnectionManager, ConnectionStats};
use crate::error::StreamError;
use crate::session::{AdmissionError, Session, SessionLifecycle, SessionOptions};
use crate::shutdown::{GracefulShutdown, ShutdownConfig, ShutdownResult};
use crate::websocket::{ChatMessage, Frame};

#[derive(Debug, Clone, Serialize)]
pub struct BroadcasterStats {
    pub connections: ConnectionStats,
    pub dispatcher: DispatcherStatsSnapshot,
    pub shutting_down: bool,
}

pub struct Broadcaster {
    connection_manager: Arc<ConnectionManager>,
    dispatcher: Arc<BroadcastDispatcher>,
    intake: DispatchHandle,
    lifecycle: SessionLifecycle,
    shutdown: CancellationToken,
    shutdown_config: ShutdownConfig,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
}

impl Broadcaster {
    /// Build the registry, dispatcher and dispatch task. Must be called inside a Tokio runtime.
    pub fn start(settings: &Settings) -> Self {
        let connection_manager = Arc::new(ConnectionManager::new());
        let dispatcher = Arc::new(BroadcastDispatcher::new(
            connection_manager.clone(),
            settings.broadcast.overflow_close_threshold,
        ));
        let shutdown = CancellationToken::new();

        let (intake, dispatch_task) = spawn_dispatch_loop(
            dispatcher.clone(),
            settings.broadcast.dispatch_buffer,
            shutdown.clone(),
        );

        let options = SessionOptions::from_settings(settings);
        let lifecycle = SessionLifecycle::new(
            connection_manager.clone(),
            intake.clone(),
            options,
            shutdown.clone(),
        );

        tracing::info!(
            queue_capacity = settings.broadcast.queue_capacity,
            overflow_policy = settings.broadcast.overflow_policy.as_str(),
            overflow_close_threshold = settings.broadcast.overflow_close_threshold,
            "Broadcaster started"
        );

        Self {
            connection_manager,
            dispatcher,
            intake,
            lifecycle,
            shutdown,
            shutdown_config: ShutdownConfig::from_settings(&settings.shutdown),
            dispatch_task: Mutex::new(Some(dispatch_task)),
        }
    }

    /// Admit an established bidirectional stream for `display_name`
    pub fn admit<R, W>(
        &self,
        display_name: impl Into<String>,
        inbound: R,
        outbound: W,
    ) -> Result<Session, AdmissionError>
    where
        R: Stream<Item = Result<Frame, StreamError>> + Send + Unpin + 'static,
        W: Sink<Frame, Error = StreamError> + Send + Unpin + 'static,
    {
        self.lifecycle.admit(display_name, inbound, outbound)
    }

    /// Fan a message out right away, bypassing the ordered intake
    pub fn broadcast(&self, message: &ChatMessage) -> BroadcastReport {
        self.dispatcher.broadcast(message)
    }

    /// Queue a message behind everything already received from peers
    pub async fn submit(&self, message: ChatMessage) -> Result<(), DispatcherClosed> {
        self.intake.submit(message).await
    }

    pub fn connection_manager(&self) -> &Arc<ConnectionManager> {
        &self.connection_manager
    }

    pub fn stats(&self) -> BroadcasterStats {
        BroadcasterStats {
            connections: self.connection_manager.stats(),
            dispatcher: self.dispatcher.stats(),
            shutting_down: self.is_shutting_down(),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// True when a registry invariant was violated; the process should exit with an error
    pub fn is_poisoned(&self) -> bool {
        self.lifecycle.is_poisoned()
    }

    /// Resolves when shutdown starts, whether requested or forced by a fatal error
    pub async fn stopped(&self) {
        self.shutdown.cancelled().await
    }

    /// Close every connection and stop the dispatch task
    pub async fn shutdown(&self, reason: &str) -> ShutdownResult {
        let dispatch_task = self
            .dispatch_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        GracefulShutdown::new(
            self.connection_manager.clone(),
            self.shutdown.clone(),
            dispatch_task,
            self.shutdown_config.clone(),
        )
        .execute(reason)
        .await
    }
}
