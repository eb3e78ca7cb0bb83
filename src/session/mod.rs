//! Admission and termination of peer sessions.
//!
//! A session owns one [`ConnectionHandle`] plus its read and write loops. The
//! supervisor task spawned by [`SessionLifecycle::admit`] is the only place that
//! unregisters the handle and releases its stream, so cleanup runs exactly once
//! no matter how many parties call [`ConnectionHandle::close`].

mod io;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::{Sink, SinkExt, Stream};
use serde::Serialize;
use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::broadcast::DispatchHandle;
use crate::config::{BroadcastConfig, Settings};
use crate::connection_manager::{
    CloseReason, ConnectionHandle, ConnectionId, ConnectionManager, RegistryError,
};
use crate::error::StreamError;
use crate::metrics::ConnectionMetrics;
use crate::websocket::{Frame, MessageCodec};

use io::{read_loop, write_loop, LoopExit, ReadOptions, WriteOptions, WriterExit};

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("Service is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Tunables shared by every session, derived from [`Settings`]
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub queue: BroadcastConfig,
    pub codec: MessageCodec,
    pub heartbeat: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    pub drain_timeout: Duration,
    pub loop_exit_timeout: Duration,
}

impl SessionOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            queue: settings.broadcast.clone(),
            codec: MessageCodec::new(settings.websocket.max_frame_bytes),
            heartbeat: settings.websocket.heartbeat(),
            idle_timeout: settings.websocket.idle_limit(),
            drain_timeout: settings.shutdown.drain(),
            loop_exit_timeout: settings.shutdown.loop_exit(),
        }
    }
}

/// What a finished session reports back to its owner
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub connection_id: ConnectionId,
    pub display_name: String,
    pub reason: CloseReason,
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub decode_errors: u64,
    /// Last time a frame arrived from the peer
    pub last_activity: DateTime<Utc>,
    pub duration: Duration,
}

/// A running session
pub struct Session {
    handle: Arc<ConnectionHandle>,
    task: JoinHandle<SessionSummary>,
}

impl Session {
    pub fn handle(&self) -> &Arc<ConnectionHandle> {
        &self.handle
    }

    pub fn id(&self) -> ConnectionId {
        self.handle.id
    }

    /// Wait for the session to end
    pub async fn join(self) -> SessionSummary {
        let handle = self.handle;
        match self.task.await {
            Ok(summary) => summary,
            Err(e) => {
                tracing::error!(connection_id = %handle.id, error = %e, "Session supervisor failed");
                handle.close(CloseReason::Shutdown);
                summarize(&handle, Duration::ZERO)
            }
        }
    }
}

/// Governs admission of new connections and cleanup of terminated ones
#[derive(Clone)]
pub struct SessionLifecycle {
    connection_manager: Arc<ConnectionManager>,
    dispatch: DispatchHandle,
    options: SessionOptions,
    shutdown: CancellationToken,
    poisoned: Arc<AtomicBool>,
}

impl SessionLifecycle {
    pub fn new(
        connection_manager: Arc<ConnectionManager>,
        dispatch: DispatchHandle,
        options: SessionOptions,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            connection_manager,
            dispatch,
            options,
            shutdown,
            poisoned: Arc::new(AtomicBool::new(false)),
        }
    }

    /// True once a registry invariant has been violated
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    /// Admit an established stream: register a handle, open it, and start its loops.
    ///
    /// Must be called from within a Tokio runtime.
    #[tracing::instrument(name = "session.admit", skip(self, display_name, inbound, outbound))]
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
        self.admit_with_id(ConnectionId::new_v4(), display_name, inbound, outbound)
    }

    pub(crate) fn admit_with_id<R, W>(
        &self,
        id: ConnectionId,
        display_name: impl Into<String>,
        inbound: R,
        outbound: W,
    ) -> Result<Session, AdmissionError>
    where
        R: Stream<Item = Result<Frame, StreamError>> + Send + Unpin + 'static,
        W: Sink<Frame, Error = StreamError> + Send + Unpin + 'static,
    {
        if self.shutdown.is_cancelled() {
            return Err(AdmissionError::ShuttingDown);
        }

        let handle = Arc::new(ConnectionHandle::with_id(
            id,
            display_name,
            self.options.queue.queue_capacity,
            self.options.queue.overflow_policy,
            self.shutdown.child_token(),
        ));

        if let Err(e) = self.connection_manager.register(handle.clone()) {
            self.escalate(&e);
            return Err(e.into());
        }

        handle.mark_open();
        ConnectionMetrics::record_opened();

        tracing::info!(
            connection_id = %handle.id,
            display_name = %handle.display_name,
            "Session opened"
        );

        let task = tokio::spawn(supervise(
            handle.clone(),
            inbound,
            outbound,
            self.connection_manager.clone(),
            self.dispatch.clone(),
            self.options.clone(),
        ));

        Ok(Session { handle, task })
    }

    fn escalate(&self, error: &RegistryError) {
        tracing::error!(error = %error, "Connection registry invariant violated, shutting down");
        self.poisoned.store(true, Ordering::SeqCst);
        self.shutdown.cancel();
    }
}

async fn supervise<R, W>(
    handle: Arc<ConnectionHandle>,
    inbound: R,
    outbound: W,
    connection_manager: Arc<ConnectionManager>,
    dispatch: DispatchHandle,
    options: SessionOptions,
) -> SessionSummary
where
    R: Stream<Item = Result<Frame, StreamError>> + Send + Unpin + 'static,
    W: Sink<Frame, Error = StreamError> + Send + Unpin + 'static,
{
    let started = Instant::now();

    let mut reader = tokio::spawn(read_loop(
        handle.clone(),
        inbound,
        dispatch,
        ReadOptions {
            codec: options.codec,
            idle_timeout: options.idle_timeout,
        },
    ));
    let mut writer = tokio::spawn(write_loop(
        handle.clone(),
        outbound,
        WriteOptions {
            heartbeat: options.heartbeat,
            drain_timeout: options.drain_timeout,
        },
    ));

    // Whichever loop ends first closes the handle, which cancels the other
    let writer_exit = tokio::select! {
        result = &mut reader => {
            let exit = reader_result(&handle, result);
            handle.close(exit.reason());
            join_within(&handle, writer, options.loop_exit_timeout + options.drain_timeout).await
        }
        result = &mut writer => {
            let writer_exit = writer_result(&handle, result);
            let reason = writer_exit
                .as_ref()
                .map(|w| w.exit.reason())
                .unwrap_or(CloseReason::WriteError);
            handle.close(reason);
            join_within(&handle, reader, options.loop_exit_timeout).await;
            writer_exit
        }
    };

    connection_manager.unregister(handle.id);

    let reason = handle.close_reason().unwrap_or(CloseReason::Shutdown);
    if let Some(WriterExit { mut sink, .. }) = writer_exit {
        release_stream(&handle, &mut sink, reason, options.loop_exit_timeout).await;
    }

    handle.mark_closed();

    let duration = started.elapsed();
    ConnectionMetrics::record_closed(reason, duration.as_secs_f64());
    tracing::info!(
        connection_id = %handle.id,
        display_name = %handle.display_name,
        reason = %reason,
        frames_sent = handle.frames_sent(),
        frames_dropped = handle.frames_dropped(),
        last_activity = %handle.last_activity(),
        duration_secs = duration.as_secs_f64(),
        "Session closed"
    );

    summarize(&handle, duration)
}

/// Say goodbye when the server ended the session, then close the sink
async fn release_stream<W>(handle: &ConnectionHandle, sink: &mut W, reason: CloseReason, limit: Duration)
where
    W: Sink<Frame, Error = StreamError> + Unpin,
{
    let release = async {
        if reason.is_server_initiated() {
            sink.send(Frame::Close).await?;
        }
        sink.close().await
    };

    match timeout(limit, release).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::debug!(connection_id = %handle.id, error = %e, "Error while closing stream");
        }
        Err(_) => {
            tracing::debug!(connection_id = %handle.id, "Timed out closing stream");
        }
    }
}

fn reader_result(handle: &ConnectionHandle, result: Result<LoopExit, JoinError>) -> LoopExit {
    result.unwrap_or_else(|e| {
        tracing::error!(connection_id = %handle.id, error = %e, "Read loop failed");
        LoopExit::Finished(CloseReason::ReadError)
    })
}

fn writer_result<W>(
    handle: &ConnectionHandle,
    result: Result<WriterExit<W>, JoinError>,
) -> Option<WriterExit<W>> {
    match result {
        Ok(exit) => Some(exit),
        Err(e) => {
            tracing::error!(connection_id = %handle.id, error = %e, "Write loop failed");
            None
        }
    }
}

/// Wait for a loop that has been told to stop; abort it if it overstays.
async fn join_within<T>(handle: &ConnectionHandle, mut task: JoinHandle<T>, limit: Duration) -> Option<T> {
    match timeout(limit, &mut task).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            tracing::error!(connection_id = %handle.id, error = %e, "I/O loop failed");
            None
        }
        Err(_) => {
            tracing::warn!(connection_id = %handle.id, "I/O loop did not stop in time, aborting");
            task.abort();
            let _ = task.await;
            None
        }
    }
}

fn summarize(handle: &ConnectionHandle, duration: Duration) -> SessionSummary {
    SessionSummary {
        connection_id: handle.id,
        display_name: handle.display_name.clone(),
        reason: handle.close_reason().unwrap_or(CloseReason::Shutdown),
        frames_sent: handle.frames_sent(),
        frames_dropped: handle.frames_dropped(),
        decode_errors: handle.decode_errors(),
        last_activity: handle.last_activity(),
        duration,
    }
}
