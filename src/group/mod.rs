//! Groups and group repositories
//!
//! A group is a named set of connections that broadcasts reach together.
//! Each broadcast is encoded once; every recipient queue receives a
//! reference-counted clone of the same frame.
//!
//! ```text
//!                      Arc<GroupRepository>
//!                 ┌─────────────────────────────┐
//!                 │ groups: DashMap<name,       │
//!                 │   Arc<Group> {              │
//!                 │     members: MemberSet,     │
//!                 │     remote: RemoteLink?,    │
//!                 │   }                         │
//!                 │ >                           │
//!                 └──────────────┬──────────────┘
//!                                │
//!        ┌───────────────────────┼───────────────────────┐
//!        ▼                       ▼                       ▼
//!   [Session]              [Session]              relay task
//!   ctx.groups().join()    group.broadcast_*()    (backplane envelopes)
//!        │                       │                       │
//!        └──► ConnectionHandle::deliver() ──► outbound queue ──► writer ──► TCP
//! ```
//!
//! Two member storage strategies are available (see [`GroupStrategy`]):
//! a concurrent map, and a copy-on-write snapshot that broadcasts read
//! without any locking.

pub mod config;
pub mod factory;
pub mod group;
pub mod members;
pub(crate) mod remote;
pub mod repository;
pub mod storage;

pub use config::{GroupConfig, GroupStrategy};
pub use factory::{DistributedGroupFactory, GroupRepositoryFactory, InMemoryGroupFactory};
pub use group::{BroadcastReport, Group, Membership};
pub use members::Recipients;
pub use repository::GroupRepository;
pub use storage::InMemoryStorage;
