//! Streaming hub server library
//!
//! `hubcast` hosts bidirectional streaming "hubs": every client keeps one
//! duplex connection open, calls hub methods by integer id, and receives
//! broadcasts from the named groups it has joined.
//!
//! # Architecture
//!
//! ```text
//!   [Client] ──frames──► Connection task ──► MethodTable ──► StreamingHub
//!                             │                                   │
//!                             │ outbound queue             ctx.groups().join()
//!                             ▼                                   ▼
//!   [Client] ◄──frames── writer task ◄─── Group::broadcast_*() ◄─ GroupRepository
//!                                                │
//!                                                └──► Backplane (Redis / memory)
//!                                                         │
//!                                                         ▼
//!                                                 other server processes
//! ```
//!
//! A broadcast is serialized once into a `BroadcastMessage`; every local
//! recipient receives a reference-counted clone of the same frame bytes.
//! When a distributed backplane is configured, the same call is also
//! published as a `DistributedEnvelope` so peer processes relay it to their
//! own members of the group.

pub mod backplane;
pub mod client;
pub mod connection;
pub mod error;
pub mod group;
pub mod hub;
pub mod protocol;
pub mod server;
pub mod session;
pub mod stats;

pub use backplane::{Backplane, MemoryBackplane};
pub use client::{ClientEvent, HubClient};
pub use connection::{ConnectionHandle, ConnectionId, ConnectionRegistry};
pub use error::{Error, Result};
pub use group::{BroadcastReport, Group, GroupConfig, GroupRepository, GroupStrategy, Recipients};
pub use hub::{HubFilter, InvokeContext, MethodTable, Next, StreamingHub};
pub use protocol::{BroadcastMessage, BroadcastSerializer, Status, StatusCode};
pub use server::{HubServer, ServerConfig};
pub use session::{HubContext, HubGroups};

#[cfg(feature = "redis")]
pub use backplane::RedisBackplane;
