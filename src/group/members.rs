//! Member sets and recipient selection
//!
//! Both storage strategies are mutated only while the owning group's gate
//! is held, so membership changes are linearizable per group. Readers never
//! take the gate: a broadcast selects its recipients from whatever state
//! the last completed mutation left behind.

use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::config::GroupStrategy;
use crate::connection::{ConnectionHandle, ConnectionId};

/// Addressing mode of one broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipients {
    /// Every member
    All,
    /// Every member except the listed connections
    Except(Vec<ConnectionId>),
    /// Only the listed connections
    Only(Vec<ConnectionId>),
}

impl Recipients {
    /// Whether `id` is addressed
    pub fn includes(&self, id: ConnectionId) -> bool {
        match self {
            Recipients::All => true,
            Recipients::Except(ids) => !ids.contains(&id),
            Recipients::Only(ids) => ids.contains(&id),
        }
    }
}

pub(crate) enum MemberSet {
    Map(DashMap<ConnectionId, ConnectionHandle>),
    Snapshot(ArcSwap<Vec<ConnectionHandle>>),
}

impl MemberSet {
    pub(crate) fn new(strategy: GroupStrategy) -> Self {
        match strategy {
            GroupStrategy::ConcurrentMap => MemberSet::Map(DashMap::new()),
            GroupStrategy::CopyOnWrite => MemberSet::Snapshot(ArcSwap::from_pointee(Vec::new())),
        }
    }

    /// Insert a member; false if it is already present
    pub(crate) fn insert(&self, handle: ConnectionHandle) -> bool {
        match self {
            MemberSet::Map(members) => match members.entry(handle.id()) {
                Entry::Occupied(_) => false,
                Entry::Vacant(slot) => {
                    slot.insert(handle);
                    true
                }
            },
            MemberSet::Snapshot(snapshot) => {
                let current = snapshot.load();
                if current.iter().any(|member| member.id() == handle.id()) {
                    return false;
                }
                let mut next = Vec::with_capacity(current.len() + 1);
                next.extend(current.iter().cloned());
                next.push(handle);
                snapshot.store(Arc::new(next));
                true
            }
        }
    }

    /// Remove a member; false if it was not present
    pub(crate) fn remove(&self, id: ConnectionId) -> bool {
        match self {
            MemberSet::Map(members) => members.remove(&id).is_some(),
            MemberSet::Snapshot(snapshot) => {
                let current = snapshot.load();
                if !current.iter().any(|member| member.id() == id) {
                    return false;
                }
                let next: Vec<_> = current
                    .iter()
                    .filter(|member| member.id() != id)
                    .cloned()
                    .collect();
                snapshot.store(Arc::new(next));
                true
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            MemberSet::Map(members) => members.len(),
            MemberSet::Snapshot(snapshot) => snapshot.load().len(),
        }
    }

    pub(crate) fn contains(&self, id: ConnectionId) -> bool {
        match self {
            MemberSet::Map(members) => members.contains_key(&id),
            MemberSet::Snapshot(snapshot) => snapshot.load().iter().any(|member| member.id() == id),
        }
    }

    /// Handles of the addressed members
    pub(crate) fn select(&self, recipients: &Recipients) -> Vec<ConnectionHandle> {
        match (self, recipients) {
            // Direct lookups avoid walking the whole map for targeted sends
            (MemberSet::Map(members), Recipients::Only(ids)) => ids
                .iter()
                .filter_map(|id| members.get(id).map(|entry| entry.value().clone()))
                .collect(),
            (MemberSet::Map(members), _) => members
                .iter()
                .filter(|entry| recipients.includes(*entry.key()))
                .map(|entry| entry.value().clone())
                .collect(),
            (MemberSet::Snapshot(snapshot), _) => snapshot
                .load()
                .iter()
                .filter(|member| recipients.includes(member.id()))
                .cloned()
                .collect(),
        }
    }

    pub(crate) fn ids(&self) -> Vec<ConnectionId> {
        match self {
            MemberSet::Map(members) => members.iter().map(|entry| *entry.key()).collect(),
            MemberSet::Snapshot(snapshot) => snapshot.load().iter().map(|m| m.id()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn both() -> [MemberSet; 2] {
        [
            MemberSet::new(GroupStrategy::ConcurrentMap),
            MemberSet::new(GroupStrategy::CopyOnWrite),
        ]
    }

    #[test]
    fn test_insert_is_unique() {
        for set in both() {
            let (handle, _rx) = ConnectionHandle::channel(1);
            assert!(set.insert(handle.clone()));
            assert!(!set.insert(handle.clone()));
            assert_eq!(set.len(), 1);
            assert!(set.contains(handle.id()));
        }
    }

    #[test]
    fn test_remove() {
        for set in both() {
            let (handle, _rx) = ConnectionHandle::channel(1);
            set.insert(handle.clone());
            assert!(set.remove(handle.id()));
            assert!(!set.remove(handle.id()));
            assert_eq!(set.len(), 0);
        }
    }

    #[test]
    fn test_select_modes() {
        for set in both() {
            let handles: Vec<_> = (0..3).map(|_| ConnectionHandle::channel(1).0).collect();
            for handle in &handles {
                set.insert(handle.clone());
            }
            let [a, b, c] = [handles[0].id(), handles[1].id(), handles[2].id()];

            assert_eq!(set.select(&Recipients::All).len(), 3);

            let mut except: Vec<_> = set
                .select(&Recipients::Except(vec![a]))
                .iter()
                .map(|h| h.id())
                .collect();
            except.sort();
            let mut expected = vec![b, c];
            expected.sort();
            assert_eq!(except, expected);

            let only: Vec<_> = set
                .select(&Recipients::Only(vec![c, ConnectionId::new()]))
                .iter()
                .map(|h| h.id())
                .collect();
            assert_eq!(only, vec![c]);
        }
    }

    #[test]
    fn test_snapshot_readers_keep_old_state() {
        let set = MemberSet::new(GroupStrategy::CopyOnWrite);
        let (first, _rx1) = ConnectionHandle::channel(1);
        set.insert(first);

        let selected = set.select(&Recipients::All);
        let (second, _rx2) = ConnectionHandle::channel(1);
        set.insert(second);

        assert_eq!(selected.len(), 1);
        assert_eq!(set.len(), 2);
    }
}
