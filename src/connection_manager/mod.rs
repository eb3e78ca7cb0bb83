//! Connection handles, their outbound queues, and the registry of live connections.

mod queue;
mod registry;
mod stats;
mod types;

pub use queue::{OutboundQueue, OverflowPolicy, QueueOverflow};
pub use registry::{ConnectionManager, RegistryError};
pub use stats::ConnectionStats;
pub use types::{CloseReason, ConnectionHandle, ConnectionId, SessionState};
