//! Group configuration

use std::time::Duration;

use crate::protocol::constants::DEFAULT_MAX_FRAME_SIZE;
use crate::protocol::BroadcastSerializer;

/// How a group stores its member set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupStrategy {
    /// Members live in a concurrent map; broadcasts iterate it shard by shard
    #[default]
    ConcurrentMap,
    /// Members live in an immutable snapshot swapped on every change;
    /// broadcasts read the snapshot without locking
    CopyOnWrite,
}

/// Group configuration options
#[derive(Debug, Clone)]
pub struct GroupConfig {
    /// Member storage strategy
    pub strategy: GroupStrategy,

    /// Longest time a broadcast waits for one recipient's outbound queue
    pub delivery_timeout: Duration,

    /// Maximum serialized size of one broadcast's arguments
    pub max_payload_size: usize,

    /// Namespace of backplane channel and counter names
    pub key_prefix: String,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            strategy: GroupStrategy::ConcurrentMap,
            delivery_timeout: Duration::from_secs(5),
            max_payload_size: DEFAULT_MAX_FRAME_SIZE,
            key_prefix: "hubcast".to_string(),
        }
    }
}

impl GroupConfig {
    /// Set the member storage strategy
    pub fn strategy(mut self, strategy: GroupStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set the per-recipient delivery timeout
    pub fn delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    /// Set the maximum broadcast payload size
    pub fn max_payload_size(mut self, size: usize) -> Self {
        self.max_payload_size = size;
        self
    }

    /// Set the backplane key prefix
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Serializer honoring the payload limit
    pub fn serializer(&self) -> BroadcastSerializer {
        BroadcastSerializer::new(self.max_payload_size as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GroupConfig::default();

        assert_eq!(config.strategy, GroupStrategy::ConcurrentMap);
        assert_eq!(config.delivery_timeout, Duration::from_secs(5));
        assert_eq!(config.max_payload_size, DEFAULT_MAX_FRAME_SIZE);
        assert_eq!(config.key_prefix, "hubcast");
    }

    #[test]
    fn test_builder_strategy() {
        let config = GroupConfig::default().strategy(GroupStrategy::CopyOnWrite);

        assert_eq!(config.strategy, GroupStrategy::CopyOnWrite);
    }

    #[test]
    fn test_builder_delivery_timeout() {
        let config = GroupConfig::default().delivery_timeout(Duration::from_millis(250));

        assert_eq!(config.delivery_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_builder_key_prefix() {
        let config = GroupConfig::default().key_prefix("chat");

        assert_eq!(config.key_prefix, "chat");
    }

    #[test]
    fn test_serializer_uses_payload_limit() {
        let config = GroupConfig::default().max_payload_size(4);

        assert_eq!(config.serializer().max_payload_size(), 4);
        assert!(config.serializer().encode(&"too long").is_err());
    }
}
