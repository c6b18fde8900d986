//! Named multicast group

use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

use super::config::GroupConfig;
use super::members::{MemberSet, Recipients};
use super::remote::RemoteLink;
use super::storage::{InMemoryStorage, MemberStorage};
use crate::connection::{ConnectionHandle, ConnectionId};
use crate::error::{DeliveryError, Error, Result};
use crate::protocol::BroadcastMessage;
use crate::stats::HubMetrics;

/// Called once when a group retires, so its owner can drop it
pub(crate) type EvictHook = Box<dyn Fn(&Group) + Send + Sync>;

type Outbox = mpsc::UnboundedSender<(Recipients, BroadcastMessage)>;

/// Outcome of adding a member
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    /// The connection became a member
    Added,
    /// The connection already was a member
    AlreadyMember,
    /// The group lost its last member and is being evicted; join a fresh
    /// instance through the repository
    Retired,
}

/// Result of one broadcast call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Local recipients whose queue accepted the frame
    pub delivered: usize,
    /// Local recipients that could not be reached
    pub failed: usize,
    /// Whether the broadcast was handed to the backplane
    pub published: bool,
}

#[derive(Debug, Default)]
struct Gate {
    retired: bool,
}

/// A named set of member connections with broadcast primitives
///
/// Groups are created by a [`GroupRepository`](super::GroupRepository) and
/// handed out as `Arc<Group>`. A group retires when its last member leaves;
/// a retired group refuses new members and removes itself from its
/// repository.
pub struct Group {
    name: String,
    this: Weak<Group>,
    config: Arc<GroupConfig>,
    members: MemberSet,
    /// Serializes member changes
    gate: Mutex<Gate>,
    storage: OnceLock<Arc<dyn MemberStorage>>,
    /// Queue of posted broadcasts, drained by one task
    outbox: OnceLock<Outbox>,
    remote: Option<RemoteLink>,
    evict: EvictHook,
    metrics: Arc<HubMetrics>,
}

impl Group {
    pub(crate) fn new(
        name: String,
        config: Arc<GroupConfig>,
        remote: Option<RemoteLink>,
        evict: EvictHook,
        metrics: Arc<HubMetrics>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            members: MemberSet::new(config.strategy),
            name,
            this: this.clone(),
            config,
            gate: Mutex::new(Gate::default()),
            storage: OnceLock::new(),
            outbox: OnceLock::new(),
            remote,
            evict,
            metrics,
        })
    }

    /// Group name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether broadcasts are shared with other processes
    pub fn is_distributed(&self) -> bool {
        self.remote.is_some()
    }

    pub fn config(&self) -> &GroupConfig {
        &self.config
    }

    /// Add a member
    ///
    /// For a distributed group the first local member subscribes to the
    /// group channel, and every added member increments the shared counter.
    pub async fn add(&self, handle: ConnectionHandle) -> Membership {
        let id = handle.id();
        let outcome = match &self.remote {
            None => self.insert_member(handle),
            Some(remote) => {
                let mut relay = remote.lock().await;
                let outcome = self.insert_member(handle);
                if outcome == Membership::Added {
                    remote.ensure_relay(&mut relay, self.this.clone()).await;
                    remote.increment().await;
                }
                outcome
            }
        };

        if outcome == Membership::Added {
            tracing::debug!(group = %self.name, connection_id = %id, "Member joined");
        }
        outcome
    }

    /// Remove a member
    ///
    /// Returns true iff this removal left the group empty. An emptied group
    /// retires, releases its channel subscription and is evicted from its
    /// repository.
    pub async fn remove(&self, id: ConnectionId) -> bool {
        let (removed, emptied) = match &self.remote {
            None => self.remove_member(id),
            Some(remote) => {
                let mut relay = remote.lock().await;
                let (removed, emptied) = self.remove_member(id);
                if removed {
                    remote.decrement().await;
                    if emptied {
                        remote.stop_relay(&mut relay);
                    }
                }
                (removed, emptied)
            }
        };

        if removed {
            if let Some(storage) = self.storage.get() {
                storage.remove_member(id);
            }
            tracing::debug!(group = %self.name, connection_id = %id, "Member left");
        }
        if emptied {
            (self.evict)(self);
            tracing::info!(group = %self.name, "Group emptied");
        }
        emptied
    }

    fn insert_member(&self, handle: ConnectionHandle) -> Membership {
        let gate = self.gate.lock();
        if gate.retired {
            Membership::Retired
        } else if self.members.insert(handle) {
            Membership::Added
        } else {
            Membership::AlreadyMember
        }
    }

    fn remove_member(&self, id: ConnectionId) -> (bool, bool) {
        let mut gate = self.gate.lock();
        if gate.retired || !self.members.remove(id) {
            return (false, false);
        }
        let emptied = self.members.len() == 0;
        if emptied {
            gate.retired = true;
        }
        (true, emptied)
    }

    /// Retire the group if it has no members; used by the repository
    pub(crate) fn retire_if_empty(&self) -> bool {
        let mut gate = self.gate.lock();
        if gate.retired {
            return true;
        }
        if self.members.len() == 0 {
            gate.retired = true;
        }
        gate.retired
    }

    pub fn is_retired(&self) -> bool {
        self.gate.lock().retired
    }

    /// Number of members across every process sharing this group
    ///
    /// Distributed groups read the shared counter and fall back to the
    /// local count when the backplane is unreachable.
    pub async fn member_count(&self) -> usize {
        match &self.remote {
            None => self.local_member_count(),
            Some(remote) => match remote.count().await {
                Some(count) => count,
                None => self.local_member_count(),
            },
        }
    }

    /// Number of members connected to this process
    pub fn local_member_count(&self) -> usize {
        self.members.len()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.members.contains(id)
    }

    pub fn is_empty(&self) -> bool {
        self.members.len() == 0
    }

    /// Ids of the local members
    pub fn member_ids(&self) -> Vec<ConnectionId> {
        self.members.ids()
    }

    /// Typed storage attached to this group's members
    ///
    /// The first call fixes the value type; asking for another type fails.
    /// Distributed groups have no storage.
    pub fn storage<T: Send + Sync + 'static>(&self) -> Result<Arc<InMemoryStorage<T>>> {
        if self.remote.is_some() {
            return Err(Error::StorageUnsupported(self.name.clone()));
        }
        let erased = self
            .storage
            .get_or_init(|| Arc::new(InMemoryStorage::<T>::new()) as Arc<dyn MemberStorage>);
        Arc::clone(erased)
            .into_any()
            .downcast::<InMemoryStorage<T>>()
            .map_err(|_| Error::StorageTypeMismatch(self.name.clone()))
    }

    /// Serialize `args` once and send them to the addressed members
    pub async fn broadcast<T: Serialize + ?Sized>(
        &self,
        recipients: Recipients,
        method_id: i32,
        args: &T,
    ) -> Result<BroadcastReport> {
        let message = self.config.serializer().message(method_id, args)?;
        Ok(self.dispatch(recipients, &message).await)
    }

    /// Send to every member
    pub async fn broadcast_all(&self, message: &BroadcastMessage) -> BroadcastReport {
        self.dispatch(Recipients::All, message).await
    }

    /// Send to every member except the calling connection
    pub async fn broadcast_except_self(
        &self,
        caller: ConnectionId,
        message: &BroadcastMessage,
    ) -> BroadcastReport {
        self.dispatch(Recipients::Except(vec![caller]), message).await
    }

    /// Send to every member except `id`
    pub async fn broadcast_except(&self, id: ConnectionId, message: &BroadcastMessage) -> BroadcastReport {
        self.dispatch(Recipients::Except(vec![id]), message).await
    }

    /// Send to every member except the listed ids
    pub async fn broadcast_except_many(
        &self,
        ids: &[ConnectionId],
        message: &BroadcastMessage,
    ) -> BroadcastReport {
        self.dispatch(Recipients::Except(ids.to_vec()), message).await
    }

    /// Send to `id` only
    pub async fn broadcast_to(&self, id: ConnectionId, message: &BroadcastMessage) -> BroadcastReport {
        self.dispatch(Recipients::Only(vec![id]), message).await
    }

    /// Send to the listed ids only
    pub async fn broadcast_to_many(
        &self,
        ids: &[ConnectionId],
        message: &BroadcastMessage,
    ) -> BroadcastReport {
        self.dispatch(Recipients::Only(ids.to_vec()), message).await
    }

    /// Queue a broadcast without waiting for delivery
    ///
    /// Posted broadcasts are dispatched one at a time in the order they were
    /// posted, so a slow member delays later posts but never the caller.
    /// No order is kept relative to awaited broadcasts. Must be called from
    /// within a Tokio runtime.
    pub fn post(&self, recipients: Recipients, message: BroadcastMessage) {
        let outbox = self.outbox.get_or_init(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(drain_outbox(self.this.clone(), rx));
            tx
        });
        if outbox.send((recipients, message)).is_err() {
            tracing::debug!(group = %self.name, "Outbox closed, dropping broadcast");
        }
    }

    /// Deliver locally, then publish to peer nodes
    ///
    /// The call returns once every addressed local recipient has queued the
    /// frame or failed, so consecutive broadcasts from one caller reach each
    /// recipient in order.
    pub async fn dispatch(&self, recipients: Recipients, message: &BroadcastMessage) -> BroadcastReport {
        self.metrics.broadcast();
        let mut report = self.deliver_local(message, &recipients).await;
        if let Some(remote) = &self.remote {
            report.published = remote.publish(recipients, message).await;
        }
        report
    }

    /// Queue the frame on every addressed local member
    ///
    /// Failures are counted, never propagated. Recipients whose session is
    /// gone are removed from the group in the background.
    pub(crate) async fn deliver_local(
        &self,
        message: &BroadcastMessage,
        recipients: &Recipients,
    ) -> BroadcastReport {
        let targets = self.members.select(recipients);
        if targets.is_empty() {
            return BroadcastReport::default();
        }

        let timeout = self.config.delivery_timeout;
        let results = join_all(
            targets
                .iter()
                .map(|target| target.deliver(message.frame().clone(), timeout)),
        )
        .await;

        let mut report = BroadcastReport::default();
        let mut closed = Vec::new();
        for (target, result) in targets.iter().zip(results) {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(
                        group = %self.name,
                        connection_id = %target.id(),
                        error = %e,
                        "Broadcast delivery failed"
                    );
                    if e == DeliveryError::Closed {
                        closed.push(target.id());
                    }
                }
            }
        }
        self.metrics.deliveries(report.delivered, report.failed);

        if !closed.is_empty() {
            self.remove_in_background(closed);
        }
        report
    }

    fn remove_in_background(&self, ids: Vec<ConnectionId>) {
        let Some(group) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            for id in ids {
                group.remove(id).await;
            }
        });
    }
}

async fn drain_outbox(
    group: Weak<Group>,
    mut outbox: mpsc::UnboundedReceiver<(Recipients, BroadcastMessage)>,
) {
    while let Some((recipients, message)) = outbox.recv().await {
        let Some(group) = group.upgrade() else {
            break;
        };
        group.dispatch(recipients, &message).await;
    }
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("name", &self.name)
            .field("local_members", &self.local_member_count())
            .field("distributed", &self.is_distributed())
            .finish()
    }
}
