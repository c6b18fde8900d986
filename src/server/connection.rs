//! Per-connection session driver
//!
//! One task per connection reads and dispatches frames; a second task owns
//! the write half and drains the connection's outbound queue, which carries
//! responses, heartbeats and group broadcasts alike.
//!
//! ```text
//!   socket ─► FrameReader ─► Session::read_loop ─► filters ─► hub method
//!                                   │                              │
//!                                   └── ServerMessage ──┐          │ broadcast
//!                                                       ▼          ▼
//!   socket ◄─ write_loop ◄──────────────── outbound queue (ConnectionHandle)
//! ```
//!
//! Teardown runs once, in this order: cancel the session token, run
//! `on_disconnected`, leave every group, unregister, let the writer flush.

use std::any::Any;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant as StdInstant};

use bytes::Bytes;
use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::config::ServerConfig;
use crate::connection::{ConnectionHandle, ConnectionId, ConnectionRegistry};
use crate::error::{DeliveryError, Error, ProtocolError, Result};
use crate::group::GroupRepository;
use crate::hub::filter::{HubEndpoint, Next};
use crate::hub::{HubFilter, InvokeContext, MethodTable, StreamingHub};
use crate::protocol::constants::NO_MESSAGE_ID;
use crate::protocol::{ClientMessage, FrameReader, ServerMessage, Status};
use crate::session::heartbeat::{self, HeartbeatAction, HeartbeatSchedule};
use crate::session::{HubContext, SessionState};
use crate::stats::HubMetrics;

/// Everything a connection task needs from its server
pub(crate) struct ServeContext<H> {
    pub(crate) config: Arc<ServerConfig>,
    pub(crate) repository: Arc<GroupRepository>,
    pub(crate) connections: Arc<ConnectionRegistry>,
    pub(crate) methods: Arc<MethodTable<H>>,
    pub(crate) filters: Arc<[Arc<dyn HubFilter>]>,
    pub(crate) metrics: Arc<HubMetrics>,
    pub(crate) shutdown: CancellationToken,
}

impl<H> Clone for ServeContext<H> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            repository: Arc::clone(&self.repository),
            connections: Arc::clone(&self.connections),
            methods: Arc::clone(&self.methods),
            filters: Arc::clone(&self.filters),
            metrics: Arc::clone(&self.metrics),
            shutdown: self.shutdown.clone(),
        }
    }
}

/// Drive one connection from accept to teardown
pub(crate) async fn serve_connection<H, S>(
    deps: ServeContext<H>,
    mut hub: H,
    stream: S,
    peer_addr: Option<SocketAddr>,
) -> Result<()>
where
    H: StreamingHub,
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let (tx, outbound) = mpsc::channel(deps.config.outbound_queue_capacity);
    let handle = ConnectionHandle::new(ConnectionId::new(), tx, deps.shutdown.child_token());
    let id = handle.id();
    let ctx = HubContext::new(handle.clone(), peer_addr, Arc::clone(&deps.repository));
    let mut state = SessionState::new(id, peer_addr);

    deps.metrics.connection_opened();
    tracing::debug!(connection_id = %id, peer = ?peer_addr, "New connection");

    let connecting = AssertUnwindSafe(hub.on_connecting(&ctx)).catch_unwind();
    let connecting = match tokio::time::timeout(deps.config.connect_timeout, connecting).await {
        Ok(Ok(result)) => result,
        Ok(Err(panic)) => {
            tracing::error!(connection_id = %id, panic = panic_message(&*panic), "on_connecting panicked");
            Err(Status::internal("connect hook failed"))
        }
        Err(_) => Err(Status::unavailable("connect timed out")),
    };
    if let Err(status) = connecting {
        tracing::warn!(connection_id = %id, status = %status, "Connection rejected");
        deps.metrics.connection_rejected();
        let reply = ServerMessage::Error {
            message_id: NO_MESSAGE_ID,
            status: status.clone(),
        };
        // Best effort: the client may already be gone
        let _ = write_and_close(&mut write_half, &reply.to_frame()).await;
        abort_connecting(&deps, &ctx, &mut state).await;
        return Err(Error::Rejected(status));
    }

    // Ready goes out ahead of anything queued during on_connecting
    let ready = ServerMessage::Ready { connection_id: id }.to_frame();
    let registered = match write_half.write_all(&ready).await {
        Ok(()) => deps.connections.register(handle.clone()),
        Err(e) => Err(e.into()),
    };
    if let Err(e) = registered {
        abort_connecting(&deps, &ctx, &mut state).await;
        return Err(e);
    }
    state.activate();

    let writer = tokio::spawn(write_loop(write_half, outbound, handle.cancellation().clone()));
    tracing::info!(connection_id = %id, peer = ?peer_addr, "Session connected");

    let reader = FrameReader::with_max_frame_size(read_half, deps.config.max_frame_size);
    let mut session = Session {
        hub,
        ctx,
        state,
        reader,
        deps,
    };
    // Teardown runs even if hub code panics
    let result = match AssertUnwindSafe(session.run()).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            tracing::error!(connection_id = %id, panic = panic_message(&*panic), "Hub panicked, closing session");
            Err(Error::HubPanicked)
        }
    };
    session.teardown(writer, &result).await;
    result
}

/// Undo a connection that never became active
async fn abort_connecting<H>(deps: &ServeContext<H>, ctx: &HubContext, state: &mut SessionState) {
    state.begin_disconnect();
    ctx.cancellation().cancel();
    ctx.groups().leave_all().await;
    state.finish();
    deps.metrics.connection_closed();
}

async fn write_and_close<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> std::io::Result<()> {
    writer.write_all(frame).await?;
    writer.shutdown().await
}

/// Drain the outbound queue into the socket until the session is cancelled
async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut outbound: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
) -> Result<()> {
    let result = drain(&mut writer, &mut outbound, &cancel).await;
    if result.is_err() {
        // Stops the read loop too
        cancel.cancel();
    }
    result
}

async fn drain<W: AsyncWrite + Unpin>(
    writer: &mut W,
    outbound: &mut mpsc::Receiver<Bytes>,
    cancel: &CancellationToken,
) -> Result<()> {
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

    // Frames queued before the close still go out
    while let Ok(frame) = outbound.try_recv() {
        writer.write_all(&frame).await?;
    }
    writer.flush().await?;
    writer.shutdown().await?;
    Ok(())
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

/// Queue a message on the connection's outbound queue
async fn send(handle: &ConnectionHandle, timeout: Duration, message: ServerMessage) -> Result<()> {
    handle
        .deliver(message.to_frame(), timeout)
        .await
        .map_err(|e| match e {
            DeliveryError::Closed => Error::ConnectionClosed,
            DeliveryError::Timeout => Error::Timeout,
        })
}

struct Session<H, S> {
    hub: H,
    ctx: HubContext,
    state: SessionState,
    reader: FrameReader<ReadHalf<S>>,
    deps: ServeContext<H>,
}

impl<H, S> Session<H, S>
where
    H: StreamingHub,
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn run(&mut self) -> Result<()> {
        self.hub.on_connected(&self.ctx).await;
        self.read_loop().await
    }

    async fn read_loop(&mut self) -> Result<()> {
        let cancel = self.ctx.cancellation().clone();
        let mut schedule = self
            .deps
            .config
            .heartbeat_interval
            .map(|interval| HeartbeatSchedule::new(interval, self.deps.config.heartbeat_timeout));

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = heartbeat::wait(schedule.as_ref(), &self.state) => {
                    self.on_heartbeat_deadline(schedule.as_mut()).await?;
                    continue;
                }
                frame = self.reader.read_frame() => frame,
            };

            let frame = match frame {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(()),
                Err(Error::Protocol(e)) => return Err(self.protocol_failure(e).await),
                Err(e) => return Err(e),
            };

            let message = match ClientMessage::decode(frame) {
                Ok(message) => message,
                Err(e) => return Err(self.protocol_failure(e).await),
            };

            match message {
                ClientMessage::Request {
                    message_id,
                    method_id,
                    args,
                } => self.invoke(Some(message_id), method_id, args).await?,
                ClientMessage::RequestFireAndForget { method_id, args } => {
                    self.invoke(None, method_id, args).await?
                }
                ClientMessage::ClientHeartbeat {
                    sequence,
                    sent_at_ms,
                    extra,
                } => {
                    let echo = ServerMessage::ClientHeartbeatResponse {
                        sequence,
                        sent_at_ms,
                        extra,
                    };
                    send(self.ctx.handle(), self.deps.config.delivery_timeout, echo).await?
                }
                ClientMessage::ServerHeartbeatResponse { sequence } => {
                    if !self.state.ack_heartbeat(sequence) {
                        tracing::debug!(connection_id = %self.state.id, sequence, "Stale heartbeat ack");
                    }
                }
            }
        }
    }

    async fn on_heartbeat_deadline(&mut self, schedule: Option<&mut HeartbeatSchedule>) -> Result<()> {
        let Some(schedule) = schedule else {
            return Ok(());
        };
        match schedule.poll(&mut self.state, Instant::now()) {
            HeartbeatAction::Send(sequence) => {
                let ping = ServerMessage::ServerHeartbeat { sequence };
                send(self.ctx.handle(), self.deps.config.delivery_timeout, ping).await
            }
            HeartbeatAction::TimedOut => {
                tracing::warn!(connection_id = %self.state.id, "Heartbeat timed out");
                Err(Error::Timeout)
            }
            HeartbeatAction::Wait => Ok(()),
        }
    }

    async fn invoke(&mut self, message_id: Option<i32>, method_id: i32, args: Bytes) -> Result<()> {
        let Some((method_name, handler)) = self.deps.methods.get(method_id) else {
            tracing::warn!(connection_id = %self.state.id, method_id, "Unknown method");
            let reply = ServerMessage::Error {
                message_id: message_id.unwrap_or(NO_MESSAGE_ID),
                status: Status::unimplemented(format!("method {} not found", method_id)),
            };
            let _ = send(self.ctx.handle(), self.deps.config.delivery_timeout, reply).await;
            return Err(ProtocolError::UnknownMethod(method_id).into());
        };

        let mut invocation = InvokeContext {
            connection_id: self.state.id,
            method_id,
            method_name,
            args,
            fire_and_forget: message_id.is_none(),
            started_at: StdInstant::now(),
        };
        let mut endpoint = HubEndpoint::new(&mut self.hub, self.ctx.clone(), handler);
        let chain = Next::new(&self.deps.filters, &mut endpoint).run(&mut invocation);
        let result = match AssertUnwindSafe(chain).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                tracing::error!(
                    connection_id = %self.state.id,
                    method = method_name,
                    panic = panic_message(&*panic),
                    "Hub method panicked"
                );
                Err(Status::internal(format!("method {} failed", method_name)))
            }
        };

        self.state.invocations += 1;
        self.deps.metrics.invocation(result.is_err());
        tracing::debug!(
            connection_id = %self.state.id,
            method = method_name,
            elapsed_us = invocation.started_at.elapsed().as_micros() as u64,
            ok = result.is_ok(),
            "Invocation completed"
        );

        let timeout = self.deps.config.delivery_timeout;
        match (message_id, result) {
            (Some(message_id), Ok(payload)) => {
                let reply = ServerMessage::Response {
                    message_id,
                    method_id,
                    payload,
                };
                send(self.ctx.handle(), timeout, reply).await
            }
            (Some(message_id), Err(status)) => {
                send(self.ctx.handle(), timeout, ServerMessage::Error { message_id, status }).await
            }
            (None, Err(status)) => {
                tracing::warn!(
                    connection_id = %self.state.id,
                    method = method_name,
                    status = %status,
                    "Fire-and-forget call failed"
                );
                Ok(())
            }
            (None, Ok(_)) => Ok(()),
        }
    }

    /// Tell the client why the session ends; the error ends the read loop
    async fn protocol_failure(&mut self, e: ProtocolError) -> Error {
        tracing::warn!(connection_id = %self.state.id, error = %e, "Protocol error");
        let reply = ServerMessage::Error {
            message_id: NO_MESSAGE_ID,
            status: Status::invalid_argument(e.to_string()),
        };
        let _ = send(self.ctx.handle(), self.deps.config.delivery_timeout, reply).await;
        e.into()
    }

    async fn teardown(mut self, writer: JoinHandle<Result<()>>, result: &Result<()>) {
        if !self.state.begin_disconnect() {
            return;
        }
        let id = self.state.id;
        match result {
            Ok(()) => tracing::debug!(connection_id = %id, "Connection closed"),
            Err(e) => tracing::debug!(connection_id = %id, error = %e, "Connection error"),
        }

        self.ctx.cancellation().cancel();
        let disconnected = AssertUnwindSafe(self.hub.on_disconnected(&self.ctx)).catch_unwind();
        if let Err(panic) = disconnected.await {
            tracing::error!(connection_id = %id, panic = panic_message(&*panic), "on_disconnected panicked");
        }
        self.ctx.groups().leave_all().await;
        self.deps.connections.unregister(id);

        let abort = writer.abort_handle();
        match tokio::time::timeout(self.deps.config.shutdown_timeout, writer).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => tracing::debug!(connection_id = %id, error = %e, "Write failed"),
            Ok(Err(e)) => tracing::warn!(connection_id = %id, error = %e, "Writer task failed"),
            Err(_) => {
                tracing::warn!(connection_id = %id, "Writer did not flush in time");
                abort.abort();
            }
        }

        self.state.finish();
        self.deps.metrics.connection_closed();
        tracing::info!(
            connection_id = %id,
            duration_ms = self.state.duration().as_millis() as u64,
            invocations = self.state.invocations,
            "Session disconnected"
        );
    }
}
