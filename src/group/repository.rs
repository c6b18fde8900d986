//! Group repository
//!
//! Maps group names to live `Group` instances. Creation goes through the
//! map's entry API, so concurrent `get_or_add` calls for an unseen name
//! construct exactly one group and every caller receives it.
//!
//! Groups do not own their repository. Each group gets an evict hook that
//! holds a weak reference to the map and removes that exact instance once
//! it retires.
//!
//! Lock order: a map shard lock may be held while taking a group's gate,
//! never the reverse. Groups release their gate before evicting.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use super::config::GroupConfig;
use super::group::{EvictHook, Group, Membership};
use super::remote::RemoteLink;
use crate::backplane::{Backplane, NodeId};
use crate::connection::{ConnectionHandle, ConnectionId};
use crate::stats::HubMetrics;

type GroupMap = DashMap<String, Arc<Group>>;

/// Process-wide registry of groups
pub struct GroupRepository {
    groups: Arc<GroupMap>,
    config: Arc<GroupConfig>,
    backplane: Option<Arc<dyn Backplane>>,
    node_id: NodeId,
    created: AtomicU64,
    metrics: Arc<HubMetrics>,
}

impl GroupRepository {
    /// Create a repository of process-local groups
    pub fn new(config: GroupConfig) -> Self {
        Self {
            groups: Arc::new(DashMap::new()),
            config: Arc::new(config),
            backplane: None,
            node_id: NodeId::new(),
            created: AtomicU64::new(0),
            metrics: Arc::new(HubMetrics::new()),
        }
    }

    /// Create a repository whose groups share broadcasts and member counts
    /// with other processes through `backplane`
    pub fn with_backplane(config: GroupConfig, backplane: Arc<dyn Backplane>) -> Self {
        Self {
            backplane: Some(backplane),
            ..Self::new(config)
        }
    }

    /// Report into shared metrics instead of private ones
    pub fn with_metrics(mut self, metrics: Arc<HubMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// This process's identity on the backplane
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn config(&self) -> &GroupConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<HubMetrics> {
        &self.metrics
    }

    pub fn is_distributed(&self) -> bool {
        self.backplane.is_some()
    }

    /// Get a group, creating it if absent
    pub fn get_or_add(&self, name: &str) -> Arc<Group> {
        if let Some(group) = self.groups.get(name) {
            return Arc::clone(group.value());
        }

        let group = self
            .groups
            .entry(name.to_string())
            .or_insert_with(|| self.build(name));
        Arc::clone(group.value())
    }

    fn build(&self, name: &str) -> Arc<Group> {
        self.created.fetch_add(1, Ordering::Relaxed);

        let remote = self.backplane.as_ref().map(|backplane| {
            RemoteLink::new(
                Arc::clone(backplane),
                self.node_id,
                &self.config.key_prefix,
                name,
                Arc::clone(&self.metrics),
            )
        });

        let groups = Arc::downgrade(&self.groups);
        let evict: EvictHook = Box::new(move |group: &Group| {
            if let Some(groups) = groups.upgrade() {
                groups.remove_if(group.name(), |_, current| {
                    std::ptr::eq(Arc::as_ptr(current), group)
                });
            }
        });

        tracing::info!(group = %name, distributed = remote.is_some(), "Group created");
        Group::new(
            name.to_string(),
            Arc::clone(&self.config),
            remote,
            evict,
            Arc::clone(&self.metrics),
        )
    }

    /// Look up a group
    pub fn get(&self, name: &str) -> Option<Arc<Group>> {
        self.groups.get(name).map(|group| Arc::clone(group.value()))
    }

    /// Add a connection to a group, creating the group if needed
    ///
    /// If the resolved group retires before the connection gets in, the
    /// name is resolved again, so the join lands in a live instance.
    pub async fn join(&self, name: &str, handle: ConnectionHandle) -> Arc<Group> {
        loop {
            let group = self.get_or_add(name);
            match group.add(handle.clone()).await {
                Membership::Added | Membership::AlreadyMember => return group,
                Membership::Retired => {
                    // The retired instance evicts itself right after retiring
                    self.groups
                        .remove_if(name, |_, current| Arc::ptr_eq(current, &group));
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    /// Remove a connection from a group
    ///
    /// Returns true iff the group became empty and was evicted.
    pub async fn leave(&self, name: &str, id: ConnectionId) -> bool {
        match self.get(name) {
            Some(group) => group.remove(id).await,
            None => false,
        }
    }

    /// Remove a group if it has no members
    ///
    /// The check and the removal happen under the group's gate, so a
    /// concurrent join either lands before (and the group stays) or finds
    /// the group retired and creates a fresh one.
    pub fn try_remove(&self, name: &str) -> bool {
        let removed = self
            .groups
            .remove_if(name, |_, group| group.retire_if_empty())
            .is_some();
        if removed {
            tracing::info!(group = %name, "Group removed");
        }
        removed
    }

    /// Number of live groups
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Names of the live groups
    pub fn names(&self) -> Vec<String> {
        self.groups.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of group instances ever constructed
    pub fn created_count(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for GroupRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupRepository")
            .field("node_id", &self.node_id)
            .field("groups", &self.groups.len())
            .field("distributed", &self.backplane.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::group::GroupStrategy;

    fn repositories() -> [GroupRepository; 2] {
        [
            GroupRepository::new(GroupConfig::default()),
            GroupRepository::new(GroupConfig::default().strategy(GroupStrategy::CopyOnWrite)),
        ]
    }

    #[tokio::test]
    async fn test_get_or_add_returns_same_instance() {
        let repository = GroupRepository::new(GroupConfig::default());

        let first = repository.get_or_add("lobby");
        let second = repository.get_or_add("lobby");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(repository.created_count(), 1);
        assert!(repository.get("other").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_get_or_add_creates_exactly_once() {
        for repository in repositories() {
            let repository = Arc::new(repository);
            let mut tasks = Vec::new();

            for _ in 0..64 {
                let repository = Arc::clone(&repository);
                tasks.push(tokio::spawn(async move { repository.get_or_add("X") }));
            }

            let mut groups = Vec::new();
            for task in tasks {
                groups.push(task.await.unwrap());
            }

            assert_eq!(repository.created_count(), 1);
            assert!(groups.iter().all(|g| Arc::ptr_eq(g, &groups[0])));
        }
    }

    #[tokio::test]
    async fn test_last_leave_evicts_group() {
        for repository in repositories() {
            let (a, _rx_a) = ConnectionHandle::channel(8);
            let (b, _rx_b) = ConnectionHandle::channel(8);

            repository.join("lobby", a.clone()).await;
            repository.join("lobby", b.clone()).await;
            assert_eq!(repository.len(), 1);

            assert!(!repository.leave("lobby", a.id()).await);
            assert!(repository.get("lobby").is_some());

            assert!(repository.leave("lobby", b.id()).await);
            assert!(repository.get("lobby").is_none());
            assert!(!repository.leave("lobby", b.id()).await);
        }
    }

    #[tokio::test]
    async fn test_join_after_eviction_creates_fresh_group() {
        let repository = GroupRepository::new(GroupConfig::default());
        let (a, _rx) = ConnectionHandle::channel(8);

        let first = repository.join("lobby", a.clone()).await;
        repository.leave("lobby", a.id()).await;
        assert!(first.is_retired());

        let second = repository.join("lobby", a.clone()).await;
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.contains(a.id()));
        assert_eq!(repository.created_count(), 2);
    }

    #[tokio::test]
    async fn test_stale_group_reference_rejoins_live_instance() {
        let repository = GroupRepository::new(GroupConfig::default());
        let (a, _rx_a) = ConnectionHandle::channel(8);
        let (b, _rx_b) = ConnectionHandle::channel(8);

        let stale = repository.join("lobby", a.clone()).await;
        stale.remove(a.id()).await;

        assert_eq!(stale.add(b.clone()).await, Membership::Retired);
        let live = repository.join("lobby", b.clone()).await;
        assert!(live.contains(b.id()));
        assert!(!stale.contains(b.id()));
    }

    #[tokio::test]
    async fn test_try_remove_only_when_empty() {
        for repository in repositories() {
            let (a, _rx) = ConnectionHandle::channel(8);

            repository.get_or_add("empty");
            assert!(repository.try_remove("empty"));
            assert!(repository.get("empty").is_none());
            assert!(!repository.try_remove("empty"));

            let group = repository.join("busy", a.clone()).await;
            assert!(!repository.try_remove("busy"));
            assert!(group.contains(a.id()));
            assert!(!group.is_retired());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_join_leave_never_duplicates_members() {
        for repository in repositories() {
            let repository = Arc::new(repository);
            let handles: Vec<_> = (0..16).map(|_| ConnectionHandle::channel(8)).collect();
            let mut tasks = Vec::new();

            for (handle, _) in &handles {
                for round in 0..20 {
                    let repository = Arc::clone(&repository);
                    let handle = handle.clone();
                    tasks.push(tokio::spawn(async move {
                        if round % 2 == 0 {
                            let group = repository.join("hot", handle.clone()).await;
                            let ids = group.member_ids();
                            let unique: HashSet<_> = ids.iter().collect();
                            assert_eq!(unique.len(), ids.len());
                        } else {
                            repository.leave("hot", handle.id()).await;
                        }
                    }));
                }
            }

            for task in tasks {
                task.await.unwrap();
            }

            // Whatever survived is a consistent set
            if let Some(group) = repository.get("hot") {
                let ids = group.member_ids();
                let unique: HashSet<_> = ids.iter().collect();
                assert_eq!(unique.len(), ids.len());
                assert_eq!(group.local_member_count(), ids.len());
            }

            // Draining every member leaves nothing behind
            for (handle, _) in &handles {
                repository.leave("hot", handle.id()).await;
            }
            assert!(repository.get("hot").map_or(true, |g| g.is_empty()));
        }
    }
}
