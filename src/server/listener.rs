//! Hub server listener
//!
//! Handles the TCP accept loop and spawns one session task per connection.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::connection::{ConnectionId, ConnectionRegistry};
use crate::error::{Error, Result};
use crate::group::{GroupRepository, GroupRepositoryFactory, InMemoryGroupFactory};
use crate::hub::filter::sort_filters;
use crate::hub::{HubFilter, MethodTable, StreamingHub};
use crate::protocol::Status;
use crate::server::config::ServerConfig;
use crate::server::connection::{serve_connection, ServeContext};
use crate::stats::{HubMetrics, HubStats};

type HubFactory<H> = dyn Fn() -> H + Send + Sync;

/// Streaming hub server
pub struct HubServer<H: StreamingHub> {
    config: Arc<ServerConfig>,
    hub_factory: Arc<HubFactory<H>>,
    repository: Arc<GroupRepository>,
    connections: Arc<ConnectionRegistry>,
    methods: Arc<MethodTable<H>>,
    filters: Arc<[Arc<dyn HubFilter>]>,
    metrics: Arc<HubMetrics>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    connection_semaphore: Option<Arc<Semaphore>>,
    fatal: Arc<Mutex<Option<ConnectionId>>>,
}

impl<H: StreamingHub> HubServer<H> {
    /// Create a server with in-process groups
    ///
    /// `hub_factory` is called once per accepted connection.
    pub fn new<F>(config: ServerConfig, hub_factory: F) -> Self
    where
        F: Fn() -> H + Send + Sync + 'static,
    {
        Self::with_group_factory(config, hub_factory, &InMemoryGroupFactory::default())
    }

    /// Create a server whose group repository comes from `factory`
    pub fn with_group_factory<F>(
        config: ServerConfig,
        hub_factory: F,
        factory: &dyn GroupRepositoryFactory,
    ) -> Self
    where
        F: Fn() -> H + Send + Sync + 'static,
    {
        let connection_semaphore = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };

        let metrics = Arc::new(HubMetrics::new());
        let repository = Arc::new(factory.create_repository(Arc::clone(&metrics)));
        let methods = H::method_table();
        tracing::debug!(
            methods = methods.len(),
            distributed = repository.is_distributed(),
            "Hub server created"
        );

        Self {
            config: Arc::new(config),
            hub_factory: Arc::new(hub_factory),
            repository,
            connections: Arc::new(ConnectionRegistry::new()),
            methods: Arc::new(methods),
            filters: Arc::from(Vec::new()),
            metrics,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            connection_semaphore,
            fatal: Arc::new(Mutex::new(None)),
        }
    }

    /// Add a filter around every hub method call
    ///
    /// Filters run in ascending `order()`; equal orders keep registration order.
    pub fn with_filter<F: HubFilter>(mut self, filter: F) -> Self {
        let mut filters = self.filters.to_vec();
        filters.push(Arc::new(filter));
        sort_filters(&mut filters);
        self.filters = filters.into();
        self
    }

    /// Group repository shared by all connections of this server
    pub fn repository(&self) -> &Arc<GroupRepository> {
        &self.repository
    }

    /// Registry of live connections
    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    pub fn metrics(&self) -> &Arc<HubMetrics> {
        &self.metrics
    }

    /// Snapshot of the server counters
    pub fn stats(&self) -> HubStats {
        self.metrics.snapshot()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Close every session and stop accepting connections
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Run the server
    ///
    /// This method blocks until the server is shut down.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Run the server with graceful shutdown
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let listener = TcpListener::bind(self.config.bind_addr).await?;

        let result = tokio::select! {
            _ = shutdown => {
                tracing::info!("Shutdown signal received");
                Ok(())
            }
            result = self.serve(listener) => result,
        };

        self.drain_sessions().await;
        result
    }

    /// Accept connections from an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        tracing::info!(addr = %addr, "Hub server listening");

        let result = tokio::select! {
            _ = self.shutdown.cancelled() => match self.fatal.lock().take() {
                Some(id) => Err(Error::DuplicateConnection(id)),
                None => Ok(()),
            },
            result = self.accept_loop(&listener) => result,
        };

        self.drain_sessions().await;
        result
    }

    /// Serve one already established stream on the current task
    ///
    /// Returns when the session ends. Subject to the connection limit.
    pub async fn serve_stream<S>(&self, stream: S, peer_addr: Option<SocketAddr>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let Some(permit) = self.acquire_permit(peer_addr) else {
            return Err(Error::Rejected(Status::unavailable("connection limit reached")));
        };
        let result = serve_connection(self.serve_context(), (self.hub_factory)(), stream, peer_addr).await;
        drop(permit);
        result
    }

    async fn accept_loop(&self, listener: &TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    self.handle_connection(socket, peer_addr);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        // Check connection limit
        let Some(permit) = self.acquire_permit(Some(peer_addr)) else {
            return;
        };

        if let Err(e) = self.configure_socket(&socket) {
            tracing::error!(error = %e, "Failed to configure socket");
            return;
        }

        let deps = self.serve_context();
        let hub = (self.hub_factory)();
        let fatal = Arc::clone(&self.fatal);
        let shutdown = self.shutdown.clone();

        self.tracker.spawn(async move {
            let _permit = permit;
            match serve_connection(deps, hub, socket, Some(peer_addr)).await {
                Ok(()) => {}
                Err(Error::DuplicateConnection(id)) => {
                    tracing::error!(connection_id = %id, "Duplicate connection id, stopping server");
                    *fatal.lock() = Some(id);
                    shutdown.cancel();
                }
                Err(e) => {
                    tracing::debug!(peer = %peer_addr, error = %e, "Session ended with error");
                }
            }
        });
    }

    /// `Some(None)` when no limit is configured, `None` when the limit is reached
    fn acquire_permit(&self, peer_addr: Option<SocketAddr>) -> Option<Option<OwnedSemaphorePermit>> {
        let Some(sem) = &self.connection_semaphore else {
            return Some(None);
        };
        match Arc::clone(sem).try_acquire_owned() {
            Ok(permit) => Some(Some(permit)),
            Err(_) => {
                tracing::warn!(peer = ?peer_addr, "Connection rejected: limit reached");
                self.metrics.connection_rejected();
                None
            }
        }
    }

    /// Cancel all sessions and wait for their teardown
    async fn drain_sessions(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        let open = self.tracker.len();
        if open > 0 {
            tracing::info!(sessions = open, "Waiting for sessions to close");
        }
        if tokio::time::timeout(self.config.shutdown_timeout, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(sessions = self.tracker.len(), "Sessions still open after shutdown timeout");
        }
    }

    fn serve_context(&self) -> ServeContext<H> {
        ServeContext {
            config: Arc::clone(&self.config),
            repository: Arc::clone(&self.repository),
            connections: Arc::clone(&self.connections),
            methods: Arc::clone(&self.methods),
            filters: Arc::clone(&self.filters),
            metrics: Arc::clone(&self.metrics),
            shutdown: self.shutdown.clone(),
        }
    }

    fn configure_socket(&self, socket: &TcpStream) -> std::io::Result<()> {
        if self.config.tcp_nodelay {
            socket.set_nodelay(true)?;
        }
        Ok(())
    }
}

impl<H: StreamingHub> std::fmt::Debug for HubServer<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubServer")
            .field("bind_addr", &self.config.bind_addr)
            .field("connections", &self.connections.len())
            .field("groups", &self.repository.len())
            .finish()
    }
}
