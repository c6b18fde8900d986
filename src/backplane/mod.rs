//! Distributed broadcast transport
//!
//! A [`Backplane`] relays group broadcasts between server processes that
//! share group names, and keeps a cross-process member counter per group.
//!
//! ```text
//!   process A                      backplane                    process B
//!   Group "lobby" ──publish──► channel "<prefix>:group:lobby" ──► relay task
//!        │                                                          │
//!   local members                                           Group "lobby"
//!                                                            local members
//! ```
//!
//! Envelopes carry the id of the node that published them; relays drop
//! their own node's envelopes, so local members are never delivered twice
//! and nothing received from the channel is ever re-published.
//!
//! Every backplane failure is contained: the group keeps delivering to its
//! local members and logs the failure.

pub mod envelope;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use envelope::DistributedEnvelope;
pub use memory::MemoryBackplane;
#[cfg(feature = "redis")]
pub use self::redis::RedisBackplane;

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::BackplaneError;

/// Buffer size of a subscription's delivery queue
pub const SUBSCRIPTION_BUFFER: usize = 1024;

/// Identifier of one server process on the backplane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(Uuid);

impl NodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pub/sub channel carrying a group's broadcasts
pub fn channel_name(prefix: &str, group: &str) -> String {
    format!("{}:group:{}", prefix, group)
}

/// Key of a group's cross-process member counter
pub fn counter_key(prefix: &str, group: &str) -> String {
    format!("{}:group-members:{}", prefix, group)
}

/// External pub/sub and counter service shared by server processes
#[async_trait]
pub trait Backplane: Send + Sync + 'static {
    /// Publish a payload to every subscriber of `channel`
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BackplaneError>;

    /// Subscribe to `channel`
    ///
    /// Messages published after this returns are delivered to the
    /// subscription. Dropping the subscription unsubscribes.
    async fn subscribe(&self, channel: &str) -> Result<Subscription, BackplaneError>;

    /// Increment a counter, returning the new value
    async fn increment(&self, key: &str) -> Result<i64, BackplaneError>;

    /// Decrement a counter, returning the new value
    ///
    /// The key is deleted in the same atomic step when the value drops to
    /// zero or below.
    async fn decrement(&self, key: &str) -> Result<i64, BackplaneError>;

    /// Read a counter; a missing key reads as zero
    async fn count(&self, key: &str) -> Result<i64, BackplaneError>;
}

/// Stream of payloads received on one channel
#[derive(Debug)]
pub struct Subscription {
    channel: String,
    rx: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
}

impl Subscription {
    /// Wrap a receiving queue fed by a backend task that watches `cancel`
    pub fn new(channel: impl Into<String>, rx: mpsc::Receiver<Bytes>, cancel: CancellationToken) -> Self {
        Self {
            channel: channel.into(),
            rx,
            cancel,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next payload, or `None` once the backend stopped delivering
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
