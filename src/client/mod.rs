//! Hub client
//!
//! A minimal client for hub servers: it performs the Ready handshake, sends
//! calls correlated by message id, answers server heartbeats, and surfaces
//! group broadcasts as [`ClientEvent`]s.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::connection::ConnectionId;
use crate::error::{Error, ProtocolError, Result};
use crate::protocol::constants::NO_MESSAGE_ID;
use crate::protocol::{BroadcastMessage, BroadcastSerializer, ClientMessage, FrameReader, ServerMessage, Status};

const OUTBOUND_CAPACITY: usize = 256;
const EVENT_CAPACITY: usize = 256;

/// Default time a call waits for its response
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

type PendingCalls = DashMap<i32, oneshot::Sender<std::result::Result<Bytes, Status>>>;

/// Events from the hub client
#[derive(Debug)]
pub enum ClientEvent {
    /// A group broadcast addressed to this client
    Broadcast(BroadcastMessage),

    /// The server ended the session with an error status
    Terminated(Status),

    /// Disconnected
    Disconnected,
}

/// Hub client
///
/// # Example
/// ```no_run
/// use hubcast::client::{ClientEvent, HubClient};
///
/// # async fn example() -> hubcast::Result<()> {
/// let (client, mut events) = HubClient::connect("127.0.0.1:7070").await?;
///
/// tokio::spawn(async move {
///     while let Some(event) = events.recv().await {
///         println!("Event: {:?}", event);
///     }
/// });
///
/// let joined: bool = client.invoke(1, &"lobby").await?;
/// # let _ = joined;
/// # Ok(())
/// # }
/// ```
pub struct HubClient {
    connection_id: ConnectionId,
    outbound: mpsc::Sender<Bytes>,
    pending: Arc<PendingCalls>,
    next_message_id: AtomicI32,
    serializer: BroadcastSerializer,
    call_timeout: Duration,
    cancel: CancellationToken,
}

impl HubClient {
    /// Connect over TCP and wait for the server's Ready marker
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<(Self, mpsc::Receiver<ClientEvent>)> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Self::from_stream(stream).await
    }

    /// Run the client over an established stream
    ///
    /// Fails with `Error::Rejected` if the hub refuses the connection.
    pub async fn from_stream<S>(stream: S) -> Result<(Self, mpsc::Receiver<ClientEvent>)>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FrameReader::new(read_half);

        let first = reader.read_frame().await?.ok_or(Error::ConnectionClosed)?;
        let connection_id = match ServerMessage::decode(first)? {
            ServerMessage::Ready { connection_id } => connection_id,
            ServerMessage::Error { status, .. } => return Err(Error::Rejected(status)),
            _ => return Err(ProtocolError::UnexpectedMessage("expected Ready").into()),
        };
        tracing::debug!(connection_id = %connection_id, "Hub client connected");

        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        let pending = Arc::new(PendingCalls::new());
        let cancel = CancellationToken::new();

        tokio::spawn(write_loop(write_half, outbound_rx, cancel.clone()));
        tokio::spawn(read_loop(
            reader,
            outbound.clone(),
            event_tx,
            Arc::clone(&pending),
            cancel.clone(),
        ));

        let client = Self {
            connection_id,
            outbound,
            pending,
            next_message_id: AtomicI32::new(0),
            serializer: BroadcastSerializer::default(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            cancel,
        };
        Ok((client, event_rx))
    }

    /// Set how long a call waits for its response
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Connection id assigned by the server
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn serializer(&self) -> &BroadcastSerializer {
        &self.serializer
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Call a hub method and decode its result
    pub async fn invoke<T, R>(&self, method_id: i32, args: &T) -> Result<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let payload = self.invoke_raw(method_id, self.serializer.encode(args)?).await?;
        Ok(self.serializer.decode(&payload)?)
    }

    /// Call a hub method with pre-serialized arguments
    ///
    /// A hub error comes back as `Error::Status`.
    pub async fn invoke_raw(&self, method_id: i32, args: Bytes) -> Result<Bytes> {
        let message_id = self.next_message_id();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(message_id, tx);

        let request = ClientMessage::Request {
            message_id,
            method_id,
            args,
        };
        if let Err(e) = self.send(request).await {
            self.pending.remove(&message_id);
            return Err(e);
        }

        match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(Ok(payload))) => Ok(payload),
            Ok(Ok(Err(status))) => Err(Error::Status(status)),
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                self.pending.remove(&message_id);
                Err(Error::Timeout)
            }
        }
    }

    /// Call a hub method without waiting for a result
    pub async fn fire_and_forget<T: Serialize + ?Sized>(&self, method_id: i32, args: &T) -> Result<()> {
        let args = self.serializer.encode(args)?;
        self.send(ClientMessage::RequestFireAndForget { method_id, args }).await
    }

    /// Send a client heartbeat; the server echoes it back
    pub async fn heartbeat(&self, sequence: u16) -> Result<()> {
        self.send(ClientMessage::ClientHeartbeat {
            sequence,
            sent_at_ms: 0,
            extra: Bytes::new(),
        })
        .await
    }

    /// Close the connection
    ///
    /// Queued requests are flushed before the stream is shut down.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    fn next_message_id(&self) -> i32 {
        // Skip the uncorrelated id after wrapping
        loop {
            let id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
            if id != NO_MESSAGE_ID {
                return id;
            }
        }
    }

    async fn send(&self, message: ClientMessage) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }
        self.outbound
            .send(message.to_frame())
            .await
            .map_err(|_| Error::ConnectionClosed)
    }
}

impl Drop for HubClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for HubClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubClient")
            .field("connection_id", &self.connection_id)
            .field("pending", &self.pending.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut outbound: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
) {
    let result: Result<()> = async {
        loop {
            tokio::select! {
                biased;
                frame = outbound.recv() => match frame {
                    Some(frame) => {
                        writer.write_all(&frame).await?;
                        if outbound.is_empty() {
                            writer.flush().await?;
                        }
                    }
                    None => break,
                },
                _ = cancel.cancelled() => break,
            }
        }
        while let Ok(frame) = outbound.try_recv() {
            writer.write_all(&frame).await?;
        }
        writer.shutdown().await?;
        Ok(())
    }
    .await;

    if let Err(e) = result {
        tracing::debug!(error = %e, "Hub client write failed");
        cancel.cancel();
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: FrameReader<R>,
    outbound: mpsc::Sender<Bytes>,
    events: mpsc::Sender<ClientEvent>,
    pending: Arc<PendingCalls>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = reader.read_frame() => frame,
        };
        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "Hub client read failed");
                break;
            }
        };

        let message = match ServerMessage::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "Malformed server frame");
                break;
            }
        };

        match message {
            ServerMessage::Response {
                message_id, payload, ..
            } => complete(&pending, message_id, Ok(payload)),
            ServerMessage::Error { message_id, status } if message_id == NO_MESSAGE_ID => {
                tracing::warn!(status = %status, "Session terminated by server");
                let _ = events.send(ClientEvent::Terminated(status)).await;
            }
            ServerMessage::Error { message_id, status } => complete(&pending, message_id, Err(status)),
            ServerMessage::Broadcast(message) => {
                if events.send(ClientEvent::Broadcast(message)).await.is_err() {
                    tracing::trace!("Broadcast dropped, no event receiver");
                }
            }
            ServerMessage::ServerHeartbeat { sequence } => {
                let ack = ClientMessage::ServerHeartbeatResponse { sequence }.to_frame();
                if outbound.send(ack).await.is_err() {
                    break;
                }
            }
            ServerMessage::ClientHeartbeatResponse { sequence, .. } => {
                tracing::trace!(sequence, "Client heartbeat echoed");
            }
            ServerMessage::Ready { .. } => {
                tracing::warn!("Unexpected second Ready marker");
            }
        }
    }

    cancel.cancel();
    // Outstanding calls fail with ConnectionClosed
    pending.clear();
    let _ = events.send(ClientEvent::Disconnected).await;
}

fn complete(pending: &PendingCalls, message_id: i32, result: std::result::Result<Bytes, Status>) {
    match pending.remove(&message_id) {
        Some((_, tx)) => {
            let _ = tx.send(result);
        }
        None => tracing::debug!(message_id, "Response for unknown call"),
    }
}
