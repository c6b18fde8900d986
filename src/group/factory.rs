//! Repository factories
//!
//! A hub server asks its factory for a repository at construction time, so
//! switching between process-local and distributed groups does not touch
//! hub code.

use std::fmt;
use std::sync::Arc;

use super::config::GroupConfig;
use super::repository::GroupRepository;
use crate::backplane::Backplane;
use crate::stats::HubMetrics;

/// Builds the group repository a server hands to its hubs
pub trait GroupRepositoryFactory: Send + Sync {
    fn create_repository(&self, metrics: Arc<HubMetrics>) -> GroupRepository;
}

/// Factory of process-local repositories
#[derive(Debug, Clone, Default)]
pub struct InMemoryGroupFactory {
    config: GroupConfig,
}

impl InMemoryGroupFactory {
    pub fn new(config: GroupConfig) -> Self {
        Self { config }
    }
}

impl GroupRepositoryFactory for InMemoryGroupFactory {
    fn create_repository(&self, metrics: Arc<HubMetrics>) -> GroupRepository {
        GroupRepository::new(self.config.clone()).with_metrics(metrics)
    }
}

/// Factory of repositories backed by a shared backplane
#[derive(Clone)]
pub struct DistributedGroupFactory {
    config: GroupConfig,
    backplane: Arc<dyn Backplane>,
}

impl DistributedGroupFactory {
    pub fn new(config: GroupConfig, backplane: Arc<dyn Backplane>) -> Self {
        Self { config, backplane }
    }
}

impl GroupRepositoryFactory for DistributedGroupFactory {
    fn create_repository(&self, metrics: Arc<HubMetrics>) -> GroupRepository {
        GroupRepository::with_backplane(self.config.clone(), Arc::clone(&self.backplane))
            .with_metrics(metrics)
    }
}

impl fmt::Debug for DistributedGroupFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedGroupFactory")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backplane::MemoryBackplane;

    #[test]
    fn test_factories_choose_repository_kind() {
        let metrics = Arc::new(HubMetrics::new());

        let local = InMemoryGroupFactory::default().create_repository(Arc::clone(&metrics));
        assert!(!local.is_distributed());

        let backplane = Arc::new(MemoryBackplane::new());
        let distributed = DistributedGroupFactory::new(GroupConfig::default().key_prefix("t"), backplane)
            .create_repository(Arc::clone(&metrics));
        assert!(distributed.is_distributed());
        assert_eq!(distributed.config().key_prefix, "t");
        assert!(Arc::ptr_eq(distributed.metrics(), &metrics));
    }

    #[test]
    fn test_each_repository_is_a_separate_node() {
        let backplane: Arc<dyn Backplane> = Arc::new(MemoryBackplane::new());
        let factory = DistributedGroupFactory::new(GroupConfig::default(), backplane);

        let first = factory.create_repository(Arc::new(HubMetrics::new()));
        let second = factory.create_repository(Arc::new(HubMetrics::new()));
        assert_ne!(first.node_id(), second.node_id());
    }
}
