//! Backplane link of a distributed group
//!
//! The link owns the group's subscription relay and its member counter.
//! Every backplane failure is logged and swallowed here; callers only ever
//! see degraded (local-only) behaviour.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;

use super::group::Group;
use super::members::Recipients;
use crate::backplane::{self, Backplane, DistributedEnvelope, NodeId, Subscription};
use crate::protocol::BroadcastMessage;
use crate::stats::HubMetrics;

const RESUBSCRIBE_MIN_BACKOFF: Duration = Duration::from_millis(100);
const RESUBSCRIBE_MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Running relay from the group's channel to its local members
pub(crate) struct Relay {
    task: JoinHandle<()>,
}

impl Relay {
    /// Stop relaying; dropping the task's subscription unsubscribes
    fn stop(self) {
        self.task.abort();
    }
}

pub(crate) struct RemoteLink {
    backplane: Arc<dyn Backplane>,
    node_id: NodeId,
    channel: String,
    counter: String,
    metrics: Arc<HubMetrics>,
    /// Held across every distributed membership change, so counter updates
    /// and (un)subscription happen in membership order
    relay: Mutex<Option<Relay>>,
}

impl RemoteLink {
    pub(crate) fn new(
        backplane: Arc<dyn Backplane>,
        node_id: NodeId,
        prefix: &str,
        group: &str,
        metrics: Arc<HubMetrics>,
    ) -> Self {
        Self {
            backplane,
            node_id,
            channel: backplane::channel_name(prefix, group),
            counter: backplane::counter_key(prefix, group),
            metrics,
            relay: Mutex::new(None),
        }
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, Option<Relay>> {
        self.relay.lock().await
    }

    /// Subscribe and start relaying unless a relay is already running
    pub(crate) async fn ensure_relay(&self, relay: &mut Option<Relay>, group: Weak<Group>) {
        if let Some(running) = relay.as_ref() {
            if !running.task.is_finished() {
                return;
            }
            tracing::warn!(channel = %self.channel, "Relay stopped, resubscribing");
            *relay = None;
        }

        match self.backplane.subscribe(&self.channel).await {
            Ok(subscription) => {
                let task = tokio::spawn(run_relay(
                    group,
                    Arc::clone(&self.backplane),
                    subscription,
                    self.node_id,
                    Arc::clone(&self.metrics),
                ));
                tracing::debug!(channel = %self.channel, "Subscribed to group channel");
                *relay = Some(Relay { task });
            }
            Err(e) => {
                // The next join retries the subscription
                self.metrics.backplane_error();
                tracing::warn!(channel = %self.channel, error = %e, "Group channel subscribe failed");
            }
        }
    }

    pub(crate) fn stop_relay(&self, relay: &mut Option<Relay>) {
        if let Some(running) = relay.take() {
            running.stop();
            tracing::debug!(channel = %self.channel, "Unsubscribed from group channel");
        }
    }

    pub(crate) async fn increment(&self) {
        if let Err(e) = self.backplane.increment(&self.counter).await {
            self.metrics.backplane_error();
            tracing::warn!(key = %self.counter, error = %e, "Member counter increment failed");
        }
    }

    pub(crate) async fn decrement(&self) {
        if let Err(e) = self.backplane.decrement(&self.counter).await {
            self.metrics.backplane_error();
            tracing::warn!(key = %self.counter, error = %e, "Member counter decrement failed");
        }
    }

    /// Cross-process member count, `None` if the backplane is unreachable
    pub(crate) async fn count(&self) -> Option<usize> {
        match self.backplane.count(&self.counter).await {
            Ok(count) => Some(count.max(0) as usize),
            Err(e) => {
                self.metrics.backplane_error();
                tracing::warn!(key = %self.counter, error = %e, "Member counter read failed");
                None
            }
        }
    }

    /// Publish a broadcast to peer nodes; false if the publish failed
    pub(crate) async fn publish(&self, recipients: Recipients, message: &BroadcastMessage) -> bool {
        let envelope = DistributedEnvelope::new(self.node_id, recipients, message.clone());
        match self.backplane.publish(&self.channel, envelope.encode()).await {
            Ok(()) => true,
            Err(e) => {
                self.metrics.backplane_error();
                tracing::warn!(channel = %self.channel, error = %e, "Broadcast publish failed");
                false
            }
        }
    }
}

async fn run_relay(
    group: Weak<Group>,
    backplane: Arc<dyn Backplane>,
    mut subscription: Subscription,
    node_id: NodeId,
    metrics: Arc<HubMetrics>,
) {
    loop {
        let Some(payload) = subscription.recv().await else {
            tracing::warn!(channel = %subscription.channel(), "Group channel closed");
            match resubscribe(&group, backplane.as_ref(), subscription.channel(), &metrics).await {
                Some(renewed) => {
                    subscription = renewed;
                    continue;
                }
                None => break,
            }
        };

        let envelope = match DistributedEnvelope::decode(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                metrics.backplane_error();
                tracing::warn!(channel = %subscription.channel(), error = %e, "Dropping envelope");
                continue;
            }
        };

        // Local members were served before this node published
        if envelope.origin == node_id {
            continue;
        }

        let Some(group) = group.upgrade() else {
            break;
        };
        metrics.remote_relay();
        let report = group.deliver_local(&envelope.message, &envelope.recipients).await;
        tracing::debug!(
            group = %group.name(),
            delivered = report.delivered,
            failed = report.failed,
            "Relayed remote broadcast"
        );
    }
}

/// Subscribe again with exponential backoff while the group is alive
async fn resubscribe(
    group: &Weak<Group>,
    backplane: &dyn Backplane,
    channel: &str,
    metrics: &HubMetrics,
) -> Option<Subscription> {
    let mut backoff = RESUBSCRIBE_MIN_BACKOFF;
    loop {
        tokio::time::sleep(backoff).await;
        if group.strong_count() == 0 {
            return None;
        }

        match backplane.subscribe(channel).await {
            Ok(subscription) => {
                tracing::info!(channel = %channel, "Resubscribed to group channel");
                return Some(subscription);
            }
            Err(e) => {
                metrics.backplane_error();
                tracing::warn!(channel = %channel, error = %e, "Group channel resubscribe failed");
                backoff = (backoff * 2).min(RESUBSCRIBE_MAX_BACKOFF);
            }
        }
    }
}
