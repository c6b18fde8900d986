//! Method dispatch table
//!
//! Hub methods are registered explicitly under the integer ids clients
//! call them by. A method receives the hub, a clone of the connection's
//! context and the serialized arguments, and returns the serialized result.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::protocol::Status;
use crate::session::HubContext;

/// Signature of a hub method
pub type HubMethodFn<H> =
    for<'a> fn(&'a mut H, HubContext, Bytes) -> BoxFuture<'a, Result<Bytes, Status>>;

struct MethodEntry<H> {
    name: &'static str,
    handler: HubMethodFn<H>,
}

/// Method id to handler table of one hub type
pub struct MethodTable<H> {
    methods: HashMap<i32, MethodEntry<H>>,
}

impl<H> MethodTable<H> {
    pub fn new() -> Self {
        Self {
            methods: HashMap::new(),
        }
    }

    /// Register a method; a later registration of the same id replaces the
    /// earlier one
    pub fn register(mut self, method_id: i32, name: &'static str, handler: HubMethodFn<H>) -> Self {
        if let Some(previous) = self.methods.insert(method_id, MethodEntry { name, handler }) {
            tracing::warn!(method_id, previous = previous.name, name, "Method id registered twice");
        }
        self
    }

    /// Look up a method's name and handler
    pub fn get(&self, method_id: i32) -> Option<(&'static str, HubMethodFn<H>)> {
        self.methods
            .get(&method_id)
            .map(|entry| (entry.name, entry.handler))
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl<H> Default for MethodTable<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> fmt::Debug for MethodTable<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.methods.iter().map(|(id, e)| (*id, e.name)).collect();
        ids.sort_unstable();
        f.debug_struct("MethodTable").field("methods", &ids).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        calls: u32,
    }

    fn bump<'a>(
        hub: &'a mut Counter,
        _ctx: HubContext,
        args: Bytes,
    ) -> BoxFuture<'a, Result<Bytes, Status>> {
        Box::pin(async move {
            hub.calls += 1;
            Ok(args)
        })
    }

    fn fail<'a>(
        _hub: &'a mut Counter,
        _ctx: HubContext,
        _args: Bytes,
    ) -> BoxFuture<'a, Result<Bytes, Status>> {
        Box::pin(async { Err(Status::internal("boom")) })
    }

    #[test]
    fn test_register_and_lookup() {
        let table = MethodTable::<Counter>::new()
            .register(1, "bump", bump)
            .register(2, "fail", fail);

        assert_eq!(table.len(), 2);
        assert_eq!(table.get(1).map(|(name, _)| name), Some("bump"));
        assert!(table.get(3).is_none());
    }

    #[test]
    fn test_reregistration_replaces() {
        let table = MethodTable::<Counter>::new()
            .register(1, "bump", bump)
            .register(1, "fail", fail);

        assert_eq!(table.len(), 1);
        assert_eq!(table.get(1).map(|(name, _)| name), Some("fail"));
    }

    #[tokio::test]
    async fn test_handler_runs_against_hub() {
        let table = MethodTable::<Counter>::new().register(1, "bump", bump);
        let (_, handler) = table.get(1).unwrap();
        let mut hub = Counter { calls: 0 };
        let ctx = HubContext::detached();

        let result = handler(&mut hub, ctx, Bytes::from_static(b"x")).await;
        assert_eq!(result.unwrap(), Bytes::from_static(b"x"));
        assert_eq!(hub.calls, 1);
    }
}
