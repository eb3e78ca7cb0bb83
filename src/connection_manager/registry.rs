use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;

use super::stats::ConnectionStats;
use super::types::{ConnectionHandle, ConnectionId};

/// Registry invariant violations. These indicate corruption, not a network
/// condition, and are escalated to a process shutdown by the caller.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    #[error("Connection {0} is already registered")]
    DuplicateConnection(ConnectionId),
}

/// Registry of every live connection.
///
/// Each operation only holds a shard lock for its own duration, so a snapshot
/// taken for one broadcast never waits on message delivery and never observes a
/// half-inserted entry.
pub struct ConnectionManager {
    /// connection_id -> ConnectionHandle
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Register a new connection
    pub fn register(&self, handle: Arc<ConnectionHandle>) -> Result<(), RegistryError> {
        let conn_id = handle.id;
        match self.connections.entry(conn_id) {
            Entry::Occupied(_) => return Err(RegistryError::DuplicateConnection(conn_id)),
            Entry::Vacant(slot) => {
                slot.insert(handle.clone());
            }
        }

        tracing::info!(
            connection_id = %conn_id,
            display_name = %handle.display_name,
            "Connection registered"
        );
        Ok(())
    }

    /// Unregister a connection. A no-op when the id is unknown.
    pub fn unregister(&self, connection_id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        let removed = self.connections.remove(&connection_id).map(|(_, handle)| handle);
        if let Some(ref handle) = removed {
            tracing::info!(
                connection_id = %connection_id,
                display_name = %handle.display_name,
                "Connection unregistered"
            );
        }
        removed
    }

    /// Point-in-time copy of the membership, safe to iterate while connections come and go
    pub fn snapshot(&self) -> Vec<Arc<ConnectionHandle>> {
        self.connections.iter().map(|r| r.value().clone()).collect()
    }

    /// Get connection by ID
    pub fn get_connection(&self, connection_id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(&connection_id).map(|h| h.clone())
    }

    pub fn contains(&self, connection_id: ConnectionId) -> bool {
        self.connections.contains_key(&connection_id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Get statistics
    pub fn stats(&self) -> ConnectionStats {
        let mut stats = ConnectionStats::default();
        for entry in self.connections.iter() {
            let handle = entry.value();
            stats.total_connections += 1;
            if handle.is_degraded() {
                stats.degraded_connections += 1;
            }
            stats.queued_frames += handle.outbound().len();
            stats.dropped_frames += handle.frames_dropped();
        }
        stats
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}
