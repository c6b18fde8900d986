//! Statistics and metrics for hub sessions and groups

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Live counters shared by the server, its sessions and its groups
#[derive(Debug)]
pub struct HubMetrics {
    started_at: Instant,
    active_connections: AtomicU64,
    total_connections: AtomicU64,
    rejected_connections: AtomicU64,
    invocations: AtomicU64,
    invocation_errors: AtomicU64,
    broadcasts: AtomicU64,
    deliveries: AtomicU64,
    delivery_failures: AtomicU64,
    remote_relays: AtomicU64,
    backplane_errors: AtomicU64,
}

impl HubMetrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            active_connections: AtomicU64::new(0),
            total_connections: AtomicU64::new(0),
            rejected_connections: AtomicU64::new(0),
            invocations: AtomicU64::new(0),
            invocation_errors: AtomicU64::new(0),
            broadcasts: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
            delivery_failures: AtomicU64::new(0),
            remote_relays: AtomicU64::new(0),
            backplane_errors: AtomicU64::new(0),
        }
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_rejected(&self) {
        self.rejected_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one completed hub call
    pub fn invocation(&self, failed: bool) {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.invocation_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn broadcast(&self) {
        self.broadcasts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the outcome of one fan-out
    pub fn deliveries(&self, delivered: usize, failed: usize) {
        self.deliveries.fetch_add(delivered as u64, Ordering::Relaxed);
        self.delivery_failures.fetch_add(failed as u64, Ordering::Relaxed);
    }

    pub fn remote_relay(&self) {
        self.remote_relays.fetch_add(1, Ordering::Relaxed);
    }

    pub fn backplane_error(&self) {
        self.backplane_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a point-in-time snapshot
    pub fn snapshot(&self) -> HubStats {
        HubStats {
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            rejected_connections: self.rejected_connections.load(Ordering::Relaxed),
            invocations: self.invocations.load(Ordering::Relaxed),
            invocation_errors: self.invocation_errors.load(Ordering::Relaxed),
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            remote_relays: self.remote_relays.load(Ordering::Relaxed),
            backplane_errors: self.backplane_errors.load(Ordering::Relaxed),
            uptime: self.started_at.elapsed(),
        }
    }
}

impl Default for HubMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Server-wide statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    /// Currently open sessions
    pub active_connections: u64,
    /// Sessions ever accepted
    pub total_connections: u64,
    /// Sessions refused by the connection limit or `on_connecting`
    pub rejected_connections: u64,
    /// Hub calls dispatched
    pub invocations: u64,
    /// Hub calls that returned an error status
    pub invocation_errors: u64,
    /// Broadcast calls issued on this node
    pub broadcasts: u64,
    /// Frames queued to recipients, local and relayed
    pub deliveries: u64,
    /// Frames that could not be queued
    pub delivery_failures: u64,
    /// Envelopes received from other nodes
    pub remote_relays: u64,
    /// Failed backplane operations
    pub backplane_errors: u64,
    /// Time since the metrics were created
    pub uptime: Duration,
}

impl HubStats {
    /// Fraction of deliveries that failed, 0.0 when nothing was sent
    pub fn delivery_failure_rate(&self) -> f64 {
        let attempts = self.deliveries + self.delivery_failures;
        if attempts == 0 {
            0.0
        } else {
            self.delivery_failures as f64 / attempts as f64
        }
    }
}
