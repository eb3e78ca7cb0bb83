//! Connection handle and related types

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use uuid::Uuid;

use super::queue::{OutboundQueue, OverflowPolicy, QueueOverflow};
use crate::websocket::EncodedFrame;

pub type ConnectionId = Uuid;

/// Lifecycle of one connection. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Why a connection was closed. The first recorded reason wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    PeerClosed,
    ReadError,
    WriteError,
    IdleTimeout,
    SlowConsumer,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PeerClosed => "peer_closed",
            Self::ReadError => "read_error",
            Self::WriteError => "write_error",
            Self::IdleTimeout => "idle_timeout",
            Self::SlowConsumer => "slow_consumer",
            Self::Shutdown => "shutdown",
        }
    }

    /// Whether the server decided to end the session (and should say goodbye)
    pub fn is_server_initiated(&self) -> bool {
        matches!(self, Self::IdleTimeout | Self::SlowConsumer | Self::Shutdown)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle for a single peer connection
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub display_name: String,
    pub connected_at: DateTime<Utc>,
    /// Last activity timestamp (Unix seconds) - using AtomicI64 for lock-free updates
    last_activity: AtomicI64,
    state: AtomicU8,
    outbound: OutboundQueue,
    degraded: AtomicBool,
    frames_enqueued: AtomicU64,
    frames_sent: AtomicU64,
    decode_errors: AtomicU64,
    close_reason: OnceLock<CloseReason>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(
        display_name: impl Into<String>,
        queue_capacity: usize,
        policy: OverflowPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self::with_id(Uuid::new_v4(), display_name, queue_capacity, policy, cancel)
    }

    pub fn with_id(
        id: ConnectionId,
        display_name: impl Into<String>,
        queue_capacity: usize,
        policy: OverflowPolicy,
        cancel: CancellationToken,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            display_name: display_name.into(),
            connected_at: now,
            last_activity: AtomicI64::new(now.timestamp()),
            state: AtomicU8::new(SessionState::Connecting as u8),
            outbound: OutboundQueue::new(queue_capacity, policy),
            degraded: AtomicBool::new(false),
            frames_enqueued: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            close_reason: OnceLock::new(),
            cancel,
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Connecting -> Open. Returns false if the handle was closed before it opened.
    pub fn mark_open(&self) -> bool {
        self.state
            .compare_exchange(
                SessionState::Connecting as u8,
                SessionState::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Begin closing and cancel both I/O loops.
    ///
    /// Safe to call from any number of places; only the first call records its
    /// reason and returns true.
    pub fn close(&self, reason: CloseReason) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= SessionState::Closing as u8 {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                SessionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        let _ = self.close_reason.set(reason);
        self.cancel.cancel();
        true
    }

    /// Terminal state, set once both loops have exited and the stream is released
    pub fn mark_closed(&self) {
        self.state.store(SessionState::Closed as u8, Ordering::Release);
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().copied()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once this handle is closed or the service shuts down
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Queue an encoded frame without blocking. An overflow marks the handle degraded.
    pub fn enqueue(&self, frame: EncodedFrame) -> Result<(), QueueOverflow> {
        match self.outbound.push(frame) {
            Ok(()) => {
                self.frames_enqueued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(overflow) => {
                if overflow.policy == OverflowPolicy::DropOldest {
                    // the new frame still went in
                    self.frames_enqueued.fetch_add(1, Ordering::Relaxed);
                }
                self.degraded.store(true, Ordering::Relaxed);
                Err(overflow)
            }
        }
    }

    pub fn outbound(&self) -> &OutboundQueue {
        &self.outbound
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.outbound.dropped()
    }

    pub fn frames_enqueued(&self) -> u64 {
        self.frames_enqueued.load(Ordering::Relaxed)
    }

    pub fn record_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    pub fn update_activity(&self) {
        self.last_activity
            .store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.last_activity.load(Ordering::Relaxed), 0)
            .unwrap_or_else(Utc::now)
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("display_name", &self.display_name)
            .field("state", &self.state())
            .field("queued", &self.outbound.len())
            .field("degraded", &self.is_degraded())
            .finish()
    }
}
