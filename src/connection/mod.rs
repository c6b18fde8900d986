//! Live connections
//!
//! A [`ConnectionHandle`] is the write-only receiver proxy of one session:
//! groups hold clones of it and push pre-encoded frames into the session's
//! bounded outbound queue. The session's writer task is the only consumer of
//! that queue, so frames from one broadcaster reach the socket in the order
//! they were queued.

pub mod registry;

pub use registry::ConnectionRegistry;

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::DeliveryError;

/// Process-unique connection identifier (random 128-bit)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generate a new random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Write handle to one connection's outbound queue
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    /// Create a handle over an outbound queue and the session's cancellation token
    pub fn new(id: ConnectionId, tx: mpsc::Sender<Bytes>, cancel: CancellationToken) -> Self {
        Self { id, tx, cancel }
    }

    /// Create a handle with a fresh id and queue, returning the queue's receiving end
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(ConnectionId::new(), tx, CancellationToken::new()), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Token cancelled when the session closes
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether the session is gone
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }

    /// Queue one frame, waiting at most `timeout` for queue capacity
    ///
    /// Fails immediately with `Closed` once the session is cancelled, so a
    /// broadcaster never waits on a connection that is shutting down.
    pub async fn deliver(&self, frame: Bytes, timeout: Duration) -> Result<(), DeliveryError> {
        if self.cancel.is_cancelled() {
            return Err(DeliveryError::Closed);
        }

        tokio::select! {
            _ = self.cancel.cancelled() => Err(DeliveryError::Closed),
            result = self.tx.send_timeout(frame, timeout) => result.map_err(|e| match e {
                SendTimeoutError::Closed(_) => DeliveryError::Closed,
                SendTimeoutError::Timeout(_) => DeliveryError::Timeout,
            }),
        }
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
