//! Invocation filters
//!
//! Filters wrap every inbound hub call. They run in ascending `order()`,
//! each deciding whether to continue down the chain by calling
//! [`Next::run`] or to answer the call itself.
//!
//! ```text
//!  frame ──► filter[0] ──► filter[1] ──► ... ──► hub method
//!               ◄────────── result ◄────────────────┘
//! ```

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;

use super::method::HubMethodFn;
use crate::connection::ConnectionId;
use crate::protocol::Status;
use crate::session::HubContext;

/// The call being dispatched
#[derive(Debug, Clone)]
pub struct InvokeContext {
    pub connection_id: ConnectionId,
    pub method_id: i32,
    pub method_name: &'static str,
    /// Serialized arguments; filters may replace them before continuing
    pub args: Bytes,
    /// True when the client does not wait for a response
    pub fire_and_forget: bool,
    pub started_at: Instant,
}

/// Middleware around hub calls
#[async_trait]
pub trait HubFilter: Send + Sync + 'static {
    /// Position in the chain; lower runs first
    fn order(&self) -> i32 {
        0
    }

    async fn invoke(&self, ctx: &mut InvokeContext, next: Next<'_>) -> Result<Bytes, Status>;
}

/// Final step of the chain
#[async_trait]
pub(crate) trait Endpoint: Send {
    async fn call(&mut self, ctx: &mut InvokeContext) -> Result<Bytes, Status>;
}

/// Remainder of the chain after the current filter
pub struct Next<'a> {
    filters: &'a [Arc<dyn HubFilter>],
    endpoint: &'a mut dyn Endpoint,
}

impl<'a> Next<'a> {
    pub(crate) fn new(filters: &'a [Arc<dyn HubFilter>], endpoint: &'a mut dyn Endpoint) -> Self {
        Self { filters, endpoint }
    }

    /// Continue with the next filter, or the hub method after the last one
    pub async fn run(self, ctx: &mut InvokeContext) -> Result<Bytes, Status> {
        match self.filters.split_first() {
            Some((filter, rest)) => filter.invoke(ctx, Next::new(rest, self.endpoint)).await,
            None => self.endpoint.call(ctx).await,
        }
    }
}

/// Calls the hub method resolved for this invocation
pub(crate) struct HubEndpoint<'h, H> {
    hub: &'h mut H,
    ctx: HubContext,
    handler: HubMethodFn<H>,
}

impl<'h, H> HubEndpoint<'h, H> {
    pub(crate) fn new(hub: &'h mut H, ctx: HubContext, handler: HubMethodFn<H>) -> Self {
        Self { hub, ctx, handler }
    }
}

#[async_trait]
impl<H: Send> Endpoint for HubEndpoint<'_, H> {
    async fn call(&mut self, ctx: &mut InvokeContext) -> Result<Bytes, Status> {
        (self.handler)(&mut *self.hub, self.ctx.clone(), ctx.args.clone()).await
    }
}

/// Sort filters into chain order; equal orders keep registration order
pub(crate) fn sort_filters(filters: &mut [Arc<dyn HubFilter>]) {
    filters.sort_by_key(|filter| filter.order());
}
