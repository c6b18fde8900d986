//! Per-group member storage
//!
//! Values are keyed by connection id and dropped when the member leaves the
//! group, so storage never outlives membership.

use std::any::Any;
use std::sync::Arc;

use dashmap::DashMap;

use crate::connection::ConnectionId;

/// Type-erased view the group uses to drop a departed member's value
pub(crate) trait MemberStorage: Send + Sync {
    fn remove_member(&self, id: ConnectionId);

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Typed values attached to group members
#[derive(Debug)]
pub struct InMemoryStorage<T> {
    values: DashMap<ConnectionId, T>,
}

impl<T> InMemoryStorage<T> {
    pub(crate) fn new() -> Self {
        Self {
            values: DashMap::new(),
        }
    }

    /// Set a member's value, returning the previous one
    pub fn set(&self, id: ConnectionId, value: T) -> Option<T> {
        self.values.insert(id, value)
    }

    /// Remove a member's value
    pub fn remove(&self, id: ConnectionId) -> Option<T> {
        self.values.remove(&id).map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<T: Clone> InMemoryStorage<T> {
    /// A member's value
    pub fn get(&self, id: ConnectionId) -> Option<T> {
        self.values.get(&id).map(|entry| entry.value().clone())
    }

    /// Every stored value, in no particular order
    pub fn all(&self) -> Vec<T> {
        self.values.iter().map(|entry| entry.value().clone()).collect()
    }
}

impl<T: Send + Sync + 'static> MemberStorage for InMemoryStorage<T> {
    fn remove_member(&self, id: ConnectionId) {
        self.values.remove(&id);
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
