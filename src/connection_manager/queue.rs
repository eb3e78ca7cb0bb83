//! Bounded per-connection outbound queue.
//!
//! The dispatcher is the only producer and the connection's write loop the only
//! consumer. Pushing never blocks: a full queue applies the configured
//! [`OverflowPolicy`] and reports a [`QueueOverflow`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;

use crate::websocket::EncodedFrame;

/// Which frame is sacrificed when a queue is full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued frame and accept the new one
    #[default]
    DropOldest,
    /// Reject the incoming frame
    DropNewest,
}

impl OverflowPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DropOldest => "drop_oldest",
            Self::DropNewest => "drop_newest",
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("Outbound queue full (capacity {capacity}, policy {}), {dropped_total} frames dropped so far", .policy.as_str())]
pub struct QueueOverflow {
    pub capacity: usize,
    pub policy: OverflowPolicy,
    /// Frames this queue has dropped over its lifetime, including this one
    pub dropped_total: u64,
}

pub struct OutboundQueue {
    frames: Mutex<VecDeque<EncodedFrame>>,
    capacity: usize,
    policy: OverflowPolicy,
    dropped: AtomicU64,
    ready: Notify,
}

impl OutboundQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            policy,
            dropped: AtomicU64::new(0),
            ready: Notify::new(),
        }
    }

    fn frames(&self) -> MutexGuard<'_, VecDeque<EncodedFrame>> {
        // The critical sections never panic mid-update, so a poisoned queue is still consistent
        self.frames.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue without blocking.
    pub fn push(&self, frame: EncodedFrame) -> Result<(), QueueOverflow> {
        let mut frames = self.frames();
        if frames.len() < self.capacity {
            frames.push_back(frame);
            drop(frames);
            self.ready.notify_one();
            return Ok(());
        }

        if self.policy == OverflowPolicy::DropOldest {
            frames.pop_front();
            frames.push_back(frame);
        }
        drop(frames);

        let dropped_total = self
            .dropped
            .fetch_add(1, Ordering::Relaxed)
            + 1;
        Err(QueueOverflow {
            capacity: self.capacity,
            policy: self.policy,
            dropped_total,
        })
    }

    pub fn try_pop(&self) -> Option<EncodedFrame> {
        self.frames().pop_front()
    }

    /// Wait for the next frame. Cancel safe: a frame is only removed when returned.
    pub async fn pop(&self) -> EncodedFrame {
        loop {
            if let Some(frame) = self.try_pop() {
                return frame;
            }
            self.ready.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.frames().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
