//! Hub context
//!
//! Context passed to hub hooks and methods. It is cheap to clone and may be
//! moved into tasks the hub spawns; group joins made through a context
//! after its connection closed are undone immediately.

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::connection::{ConnectionHandle, ConnectionId};
use crate::group::{Group, GroupRepository};
use crate::protocol::{BroadcastMessage, BroadcastSerializer, Status};

struct ContextInner {
    handle: ConnectionHandle,
    peer_addr: Option<SocketAddr>,
    repository: Arc<GroupRepository>,
    serializer: BroadcastSerializer,
    joined: Mutex<HashSet<String>>,
    connected_at: Instant,
}

/// Per-connection context handed to hub code
#[derive(Clone)]
pub struct HubContext {
    inner: Arc<ContextInner>,
}

impl HubContext {
    /// Create a context for a connection
    pub fn new(
        handle: ConnectionHandle,
        peer_addr: Option<SocketAddr>,
        repository: Arc<GroupRepository>,
    ) -> Self {
        let serializer = repository.config().serializer();
        Self {
            inner: Arc::new(ContextInner {
                handle,
                peer_addr,
                repository,
                serializer,
                joined: Mutex::new(HashSet::new()),
                connected_at: Instant::now(),
            }),
        }
    }

    /// Context over a fresh queue and a private repository, for unit tests
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        let (handle, _rx) = ConnectionHandle::channel(1);
        Self::new(
            handle,
            None,
            Arc::new(GroupRepository::new(crate::group::GroupConfig::default())),
        )
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.inner.handle.id()
    }

    /// Remote peer address, if the transport has one
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr
    }

    /// Write handle of this connection
    pub fn handle(&self) -> &ConnectionHandle {
        &self.inner.handle
    }

    /// Token cancelled when the connection closes
    pub fn cancellation(&self) -> &CancellationToken {
        self.inner.handle.cancellation()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.handle.cancellation().is_cancelled()
    }

    /// Time since the connection was accepted
    pub fn connected_for(&self) -> std::time::Duration {
        self.inner.connected_at.elapsed()
    }

    pub fn serializer(&self) -> &BroadcastSerializer {
        &self.inner.serializer
    }

    /// Group membership of this connection
    pub fn groups(&self) -> HubGroups<'_> {
        HubGroups { ctx: self }
    }

    /// Decode call arguments; failures map to `InvalidArgument`
    pub fn decode<T: DeserializeOwned>(&self, args: &[u8]) -> Result<T, Status> {
        self.inner
            .serializer
            .decode(args)
            .map_err(|e| Status::invalid_argument(format!("cannot decode arguments: {}", e)))
    }

    /// Encode a call result; failures map to `Internal`
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes, Status> {
        self.inner
            .serializer
            .encode(value)
            .map_err(|e| Status::internal(format!("cannot encode result: {}", e)))
    }

    /// Encode a broadcast message for `method_id`
    pub fn message<T: Serialize + ?Sized>(
        &self,
        method_id: i32,
        args: &T,
    ) -> Result<BroadcastMessage, Status> {
        self.inner
            .serializer
            .message(method_id, args)
            .map_err(|e| Status::internal(format!("cannot encode broadcast: {}", e)))
    }

    /// Push a receiver call to this connection only
    pub async fn send_to_self<T: Serialize + ?Sized>(&self, method_id: i32, args: &T) -> Result<(), Status> {
        let message = self.message(method_id, args)?;
        let timeout = self.inner.repository.config().delivery_timeout;
        self.inner
            .handle
            .deliver(message.frame().clone(), timeout)
            .await
            .map_err(|e| Status::unavailable(e.to_string()))
    }
}

impl fmt::Debug for HubContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubContext")
            .field("connection_id", &self.connection_id())
            .field("peer_addr", &self.inner.peer_addr)
            .finish()
    }
}

/// Group operations of one connection
pub struct HubGroups<'a> {
    ctx: &'a HubContext,
}

impl HubGroups<'_> {
    /// Join a group, creating it if needed
    pub async fn join(&self, name: &str) -> Result<Arc<Group>, Status> {
        let inner = &self.ctx.inner;
        if self.ctx.is_closed() {
            return Err(Status::unavailable("connection closed"));
        }

        let group = inner.repository.join(name, inner.handle.clone()).await;
        inner.joined.lock().insert(name.to_string());

        // Teardown may have drained the joined set while this join ran
        if self.ctx.is_closed() {
            self.leave(name).await;
            return Err(Status::unavailable("connection closed"));
        }
        Ok(group)
    }

    /// Leave a group; false if this connection was not a member
    pub async fn leave(&self, name: &str) -> bool {
        let inner = &self.ctx.inner;
        if !inner.joined.lock().remove(name) {
            return false;
        }
        inner.repository.leave(name, inner.handle.id()).await;
        true
    }

    /// Leave every joined group
    pub async fn leave_all(&self) {
        let inner = &self.ctx.inner;
        let names: Vec<String> = inner.joined.lock().drain().collect();
        for name in names {
            inner.repository.leave(&name, inner.handle.id()).await;
        }
    }

    /// Names of the joined groups
    pub fn joined(&self) -> Vec<String> {
        self.ctx.inner.joined.lock().iter().cloned().collect()
    }

    /// A joined group
    pub fn get(&self, name: &str) -> Option<Arc<Group>> {
        if !self.ctx.inner.joined.lock().contains(name) {
            return None;
        }
        self.ctx.inner.repository.get(name)
    }

    /// Any group of the repository, joined or not
    pub fn lookup(&self, name: &str) -> Option<Arc<Group>> {
        self.ctx.inner.repository.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::GroupConfig;

    fn context(repository: &Arc<GroupRepository>) -> (HubContext, tokio::sync::mpsc::Receiver<Bytes>) {
        let (handle, rx) = ConnectionHandle::channel(8);
        (HubContext::new(handle, None, Arc::clone(repository)), rx)
    }

    #[tokio::test]
    async fn test_join_and_leave_all() {
        let repository = Arc::new(GroupRepository::new(GroupConfig::default()));
        let (ctx, _rx) = context(&repository);

        let lobby = ctx.groups().join("lobby").await.unwrap();
        ctx.groups().join("room-1").await.unwrap();
        assert!(lobby.contains(ctx.connection_id()));

        let mut joined = ctx.groups().joined();
        joined.sort();
        assert_eq!(joined, vec!["lobby", "room-1"]);

        ctx.groups().leave_all().await;
        assert!(ctx.groups().joined().is_empty());
        assert!(repository.is_empty());
    }

    #[tokio::test]
    async fn test_leave_unjoined_group() {
        let repository = Arc::new(GroupRepository::new(GroupConfig::default()));
        let (ctx, _rx) = context(&repository);
        let (other, _rx2) = context(&repository);

        other.groups().join("lobby").await.unwrap();
        assert!(!ctx.groups().leave("lobby").await);
        assert!(ctx.groups().get("lobby").is_none());
        assert!(ctx.groups().lookup("lobby").is_some());
    }

    #[tokio::test]
    async fn test_join_after_close_is_refused() {
        let repository = Arc::new(GroupRepository::new(GroupConfig::default()));
        let (ctx, _rx) = context(&repository);
        ctx.cancellation().cancel();

        assert!(ctx.groups().join("lobby").await.is_err());
        assert!(repository.get("lobby").map_or(true, |g| g.is_empty()));
    }

    #[tokio::test]
    async fn test_send_to_self() {
        let repository = Arc::new(GroupRepository::new(GroupConfig::default()));
        let (ctx, mut rx) = context(&repository);

        ctx.send_to_self(4, "welcome").await.unwrap();
        let frame = rx.recv().await.unwrap();
        let expected = ctx.message(4, "welcome").unwrap();
        assert_eq!(frame, *expected.frame());
    }

    #[test]
    fn test_decode_failure_is_invalid_argument() {
        let ctx = HubContext::detached();
        let status = ctx.decode::<u64>(&[1, 2]).unwrap_err();
        assert_eq!(status.code, crate::protocol::StatusCode::InvalidArgument);
    }
}
