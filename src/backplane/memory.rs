//! In-process backplane
//!
//! Shares channels and counters between every repository holding a clone of
//! the same `MemoryBackplane`, which lets one process host several "nodes"
//! (repositories with distinct node ids) on a common transport.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use super::{Backplane, Subscription, SUBSCRIPTION_BUFFER};
use crate::error::BackplaneError;

#[derive(Debug, Default)]
struct Inner {
    channels: DashMap<String, broadcast::Sender<Bytes>>,
    counters: DashMap<String, i64>,
}

/// Backplane backed by in-memory channels
#[derive(Debug, Clone, Default)]
pub struct MemoryBackplane {
    inner: Arc<Inner>,
}

impl MemoryBackplane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of channels with at least one subscriber
    pub fn channel_count(&self) -> usize {
        self.inner.channels.len()
    }

    /// Whether a counter key exists
    pub fn has_counter(&self, key: &str) -> bool {
        self.inner.counters.contains_key(key)
    }

    // Subscribes under the shard lock so a concurrent cleanup cannot drop
    // the sender between lookup and subscribe
    fn receiver(&self, channel: &str) -> broadcast::Receiver<Bytes> {
        self.inner
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(SUBSCRIPTION_BUFFER).0)
            .subscribe()
    }
}

#[async_trait]
impl Backplane for MemoryBackplane {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BackplaneError> {
        if let Some(sender) = self.inner.channels.get(channel) {
            // No subscribers is not an error
            let _ = sender.send(payload);
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BackplaneError> {
        let mut source = self.receiver(channel);
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let inner = Arc::clone(&self.inner);
        let name = channel.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    received = source.recv() => match received {
                        Ok(payload) => {
                            if tx.send(payload).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(channel = %name, skipped, "Subscription lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }

            drop(source);
            inner
                .channels
                .remove_if(&name, |_, sender| sender.receiver_count() == 0);
        });

        Ok(Subscription::new(channel, rx, cancel))
    }

    async fn increment(&self, key: &str) -> Result<i64, BackplaneError> {
        let mut count = self.inner.counters.entry(key.to_string()).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn decrement(&self, key: &str) -> Result<i64, BackplaneError> {
        match self.inner.counters.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let count = *entry.get() - 1;
                if count <= 0 {
                    entry.remove();
                } else {
                    entry.insert(count);
                }
                Ok(count)
            }
            Entry::Vacant(_) => Ok(-1),
        }
    }

    async fn count(&self, key: &str) -> Result<i64, BackplaneError> {
        Ok(self.inner.counters.get(key).map(|count| *count).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let backplane = MemoryBackplane::new();
        let mut first = backplane.subscribe("c").await.unwrap();
        let mut second = backplane.subscribe("c").await.unwrap();
        let mut other = backplane.subscribe("other").await.unwrap();

        backplane.publish("c", Bytes::from_static(b"hi")).await.unwrap();

        assert_eq!(&first.recv().await.unwrap()[..], b"hi");
        assert_eq!(&second.recv().await.unwrap()[..], b"hi");
        assert!(
            tokio::time::timeout(Duration::from_millis(50), other.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let backplane = MemoryBackplane::new();
        backplane.publish("nobody", Bytes::new()).await.unwrap();
        assert_eq!(backplane.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_channel_removed_after_last_unsubscribe() {
        let backplane = MemoryBackplane::new();
        let subscription = backplane.subscribe("c").await.unwrap();
        assert_eq!(backplane.channel_count(), 1);

        drop(subscription);
        for _ in 0..100 {
            if backplane.channel_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(backplane.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_counter_deleted_at_zero() {
        let backplane = MemoryBackplane::new();
        assert_eq!(backplane.increment("k").await.unwrap(), 1);
        assert_eq!(backplane.increment("k").await.unwrap(), 2);
        assert_eq!(backplane.count("k").await.unwrap(), 2);

        assert_eq!(backplane.decrement("k").await.unwrap(), 1);
        assert!(backplane.has_counter("k"));
        assert_eq!(backplane.decrement("k").await.unwrap(), 0);
        assert!(!backplane.has_counter("k"));
        assert_eq!(backplane.count("k").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let a = MemoryBackplane::new();
        let b = a.clone();
        let mut subscription = b.subscribe("c").await.unwrap();

        a.increment("k").await.unwrap();
        a.publish("c", Bytes::from_static(b"x")).await.unwrap();

        assert_eq!(b.count("k").await.unwrap(), 1);
        assert_eq!(&subscription.recv().await.unwrap()[..], b"x");
    }
}
