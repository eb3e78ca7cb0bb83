//! The two I/O loops that drive one connection.

use std::sync::Arc;
use std::time::Duration;

use futures::{future, Sink, SinkExt, Stream, StreamExt};
use tokio::time::{timeout, Interval, MissedTickBehavior};

use crate::broadcast::DispatchHandle;
use crate::connection_manager::{CloseReason, ConnectionHandle};
use crate::error::StreamError;
use crate::metrics::InboundMetrics;
use crate::websocket::{Frame, MessageCodec};

/// How a loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopExit {
    /// The loop hit a terminal condition of its own
    Finished(CloseReason),
    /// The handle was closed elsewhere (or the service is shutting down)
    Cancelled,
}

impl LoopExit {
    pub(crate) fn reason(&self) -> CloseReason {
        match self {
            Self::Finished(reason) => *reason,
            Self::Cancelled => CloseReason::Shutdown,
        }
    }
}

/// The write loop hands its sink back so the lifecycle can close it last
pub(crate) struct WriterExit<W> {
    pub sink: W,
    pub exit: LoopExit,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ReadOptions {
    pub codec: MessageCodec,
    pub idle_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct WriteOptions {
    pub heartbeat: Option<Duration>,
    pub drain_timeout: Duration,
}

pub(crate) async fn read_loop<R>(
    handle: Arc<ConnectionHandle>,
    mut inbound: R,
    dispatch: DispatchHandle,
    options: ReadOptions,
) -> LoopExit
where
    R: Stream<Item = Result<Frame, StreamError>> + Send + Unpin + 'static,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = handle.cancelled() => return LoopExit::Cancelled,
            next = next_inbound(&mut inbound, options.idle_timeout) => next,
        };

        let decoded = match next {
            Inbound::Frame(Frame::Text(text)) => options.codec.decode(text.as_bytes()),
            Inbound::Frame(Frame::Binary(data)) => options.codec.decode(&data),
            Inbound::Frame(Frame::Ping(_)) | Inbound::Frame(Frame::Pong(_)) => {
                handle.update_activity();
                continue;
            }
            Inbound::Frame(Frame::Close) | Inbound::Ended => {
                tracing::debug!(connection_id = %handle.id, "Peer closed the stream");
                return LoopExit::Finished(CloseReason::PeerClosed);
            }
            Inbound::Failed(e) => {
                tracing::warn!(connection_id = %handle.id, error = %e, "Stream read failed");
                return LoopExit::Finished(CloseReason::ReadError);
            }
            Inbound::Idle => {
                tracing::info!(
                    connection_id = %handle.id,
                    idle_secs = options.idle_timeout.map(|d| d.as_secs()).unwrap_or_default(),
                    "Closing idle connection"
                );
                return LoopExit::Finished(CloseReason::IdleTimeout);
            }
        };

        handle.update_activity();

        let message = match decoded {
            Ok(message) => message,
            Err(e) => {
                handle.record_decode_error();
                InboundMetrics::record_decode_error();
                tracing::warn!(
                    connection_id = %handle.id,
                    error = %e,
                    "Discarding malformed frame"
                );
                continue;
            }
        };

        InboundMetrics::record_received();

        tokio::select! {
            biased;
            _ = handle.cancelled() => return LoopExit::Cancelled,
            submitted = dispatch.submit(message) => {
                if submitted.is_err() {
                    return LoopExit::Cancelled;
                }
            }
        }
    }
}

enum Inbound {
    Frame(Frame),
    Failed(StreamError),
    Ended,
    Idle,
}

async fn next_inbound<R>(inbound: &mut R, idle_timeout: Option<Duration>) -> Inbound
where
    R: Stream<Item = Result<Frame, StreamError>> + Unpin,
{
    let next = match idle_timeout {
        Some(limit) => match timeout(limit, inbound.next()).await {
            Ok(next) => next,
            Err(_) => return Inbound::Idle,
        },
        None => inbound.next().await,
    };

    match next {
        Some(Ok(frame)) => Inbound::Frame(frame),
        Some(Err(e)) => Inbound::Failed(e),
        None => Inbound::Ended,
    }
}

pub(crate) async fn write_loop<W>(
    handle: Arc<ConnectionHandle>,
    mut outbound: W,
    options: WriteOptions,
) -> WriterExit<W>
where
    W: Sink<Frame, Error = StreamError> + Send + Unpin + 'static,
{
    let mut heartbeat = options.heartbeat.map(|period| {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });

    // A popped frame the sink was not ready for when the handle closed
    let mut unsent = None;

    loop {
        let frame = tokio::select! {
            biased;
            _ = handle.cancelled() => break,
            frame = handle.outbound().pop() => Frame::Text(frame),
            _ = next_tick(&mut heartbeat) => Frame::Ping(Vec::new()),
        };

        // Wait for capacity before handing the frame over, so a cancel never loses it
        let ready = tokio::select! {
            biased;
            _ = handle.cancelled() => {
                unsent = Some(frame);
                break;
            }
            ready = future::poll_fn(|cx| outbound.poll_ready_unpin(cx)) => ready,
        };

        let is_data = matches!(frame, Frame::Text(_));
        let sent = match ready.and_then(|()| outbound.start_send_unpin(frame)) {
            // Once accepted the frame is flushed here, by the drain, or when the sink closes
            Ok(()) => tokio::select! {
                biased;
                _ = handle.cancelled() => Ok(()),
                flushed = outbound.flush() => flushed,
            },
            Err(e) => Err(e),
        };

        if let Err(e) = sent {
            tracing::warn!(connection_id = %handle.id, error = %e, "Stream write failed");
            return WriterExit {
                sink: outbound,
                exit: LoopExit::Finished(CloseReason::WriteError),
            };
        }
        if is_data {
            handle.record_sent();
        }
        if handle.is_cancelled() {
            break;
        }
    }

    // Frames already queued are flushed on shutdown and abandoned otherwise
    if matches!(handle.close_reason(), None | Some(CloseReason::Shutdown)) {
        let unsent = unsent.filter(|frame| matches!(frame, Frame::Text(_)));
        match timeout(options.drain_timeout, flush(&handle, &mut outbound, unsent)).await {
            Ok(Ok(flushed)) => {
                tracing::debug!(connection_id = %handle.id, flushed = flushed, "Flushed queued frames");
            }
            Ok(Err(e)) => {
                tracing::debug!(connection_id = %handle.id, error = %e, "Flush failed");
            }
            Err(_) => {
                tracing::debug!(
                    connection_id = %handle.id,
                    remaining = handle.outbound().len(),
                    "Drain timed out, abandoning queued frames"
                );
            }
        }
    }

    WriterExit {
        sink: outbound,
        exit: LoopExit::Cancelled,
    }
}

async fn flush<W>(
    handle: &ConnectionHandle,
    outbound: &mut W,
    in_flight: Option<Frame>,
) -> Result<usize, StreamError>
where
    W: Sink<Frame, Error = StreamError> + Unpin,
{
    let mut flushed = 0;
    let queued = std::iter::from_fn(|| handle.outbound().try_pop()).map(Frame::Text);
    for frame in in_flight.into_iter().chain(queued) {
        outbound.feed(frame).await?;
        handle.record_sent();
        flushed += 1;
    }
    outbound.flush().await?;
    Ok(flushed)
}

async fn next_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
