//! Connection registry
//!
//! Tracks the connections that are live in this process. Registration and
//! removal come from independent connection tasks, so the map is a
//! `DashMap` and no operation spans more than one shard lock.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{ConnectionHandle, ConnectionId};
use crate::error::{Error, Result};

/// Registry of locally live connections
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ConnectionHandle>,
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Register a connection
    ///
    /// Fails with `Error::DuplicateConnection` if the id is already present.
    pub fn register(&self, handle: ConnectionHandle) -> Result<()> {
        let id = handle.id();
        match self.connections.entry(id) {
            Entry::Occupied(_) => {
                tracing::error!(connection_id = %id, "Duplicate connection id");
                Err(Error::DuplicateConnection(id))
            }
            Entry::Vacant(slot) => {
                slot.insert(handle);
                tracing::debug!(connection_id = %id, "Connection registered");
                Ok(())
            }
        }
    }

    /// Unregister a connection; unknown ids are ignored
    pub fn unregister(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        let removed = self.connections.remove(&id).map(|(_, handle)| handle);
        if removed.is_some() {
            tracing::debug!(connection_id = %id, "Connection unregistered");
        }
        removed
    }

    /// Look up a connection's handle
    pub fn get(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.connections.get(&id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Number of live connections
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Ids of all live connections
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|entry| *entry.key()).collect()
    }
}
