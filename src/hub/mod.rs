//! Streaming hub definition
//!
//! A hub is a per-connection object: the server creates one instance for
//! every accepted connection, calls its lifecycle hooks, and dispatches the
//! client's calls to it by method id through its [`MethodTable`].
//!
//! ```text
//!  accept ──► on_connecting ──► Ready ──► on_connected ──► calls ... ──► on_disconnected
//!                  │
//!                  └── Err(status): error frame, connection closed
//! ```

pub mod filter;
pub mod method;

pub use filter::{HubFilter, InvokeContext, Next};
pub use method::{HubMethodFn, MethodTable};

use std::future::Future;

use crate::protocol::Status;
use crate::session::HubContext;

/// Server-side hub
///
/// Hooks run on the connection's task; calls on one connection never run
/// concurrently, so `&mut self` needs no locking.
pub trait StreamingHub: Send + Sized + 'static {
    /// Runs before the connection becomes active; an error rejects it
    fn on_connecting(&mut self, ctx: &HubContext) -> impl Future<Output = Result<(), Status>> + Send {
        let _ = ctx;
        async { Ok(()) }
    }

    /// Runs once the client has been told the connection is ready
    fn on_connected(&mut self, ctx: &HubContext) -> impl Future<Output = ()> + Send {
        let _ = ctx;
        async {}
    }

    /// Runs exactly once when the connection closes, before the
    /// connection leaves its groups
    fn on_disconnected(&mut self, ctx: &HubContext) -> impl Future<Output = ()> + Send {
        let _ = ctx;
        async {}
    }

    /// Methods clients may call
    fn method_table() -> MethodTable<Self>;
}
