//! Observability for presence tracking.
//!
//! This module provides:
//! - Atomic counters bumped on every presence operation and displacement
//! - A serializable snapshot for export by the embedding process

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Atomic counters for presence activity.
#[derive(Default)]
pub struct PresenceCounters {
    /// Presence records written.
    pub sets: AtomicU64,
    /// Successful clears (record deleted while still owned).
    pub clears: AtomicU64,
    /// Listeners displaced by a same-process reconnect.
    pub local_displacements: AtomicU64,
    /// Listeners displaced through the notification channel.
    pub remote_displacements: AtomicU64,
    /// TTL renewal attempts.
    pub renewals: AtomicU64,
    /// Renewal attempts that found the record gone or re-owned.
    pub renewal_failures: AtomicU64,
    /// Keyspace notifications handled.
    pub keyspace_events: AtomicU64,
    /// Pruner passes completed.
    pub prune_runs: AtomicU64,
    /// Dead peers reclaimed.
    pub peers_pruned: AtomicU64,
    /// Full resubscribe passes (reconnect or topology change).
    pub resubscribes: AtomicU64,
}

/// Cheap clonable handle over the counters.
#[derive(Clone, Default)]
pub struct PresenceMetrics {
    counters: Arc<PresenceCounters>,
}

impl PresenceMetrics {
    pub fn inc_sets(&self) {
        self.counters.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_clears(&self) {
        self.counters.clears.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_displacement(&self, connected_elsewhere: bool) {
        if connected_elsewhere {
            self.counters
                .remote_displacements
                .fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters
                .local_displacements
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_renewal(&self, renewed: bool) {
        self.counters.renewals.fetch_add(1, Ordering::Relaxed);
        if !renewed {
            self.counters
                .renewal_failures
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn inc_keyspace_events(&self) {
        self.counters.keyspace_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_prune_run(&self, peers_pruned: u64) {
        self.counters.prune_runs.fetch_add(1, Ordering::Relaxed);
        self.counters
            .peers_pruned
            .fetch_add(peers_pruned, Ordering::Relaxed);
    }

    pub fn inc_resubscribes(&self) {
        self.counters.resubscribes.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a point-in-time copy of every counter.
    pub fn snapshot(&self) -> PresenceMetricsSnapshot {
        PresenceMetricsSnapshot {
            sets: self.counters.sets.load(Ordering::Relaxed),
            clears: self.counters.clears.load(Ordering::Relaxed),
            local_displacements: self.counters.local_displacements.load(Ordering::Relaxed),
            remote_displacements: self.counters.remote_displacements.load(Ordering::Relaxed),
            renewals: self.counters.renewals.load(Ordering::Relaxed),
            renewal_failures: self.counters.renewal_failures.load(Ordering::Relaxed),
            keyspace_events: self.counters.keyspace_events.load(Ordering::Relaxed),
            prune_runs: self.counters.prune_runs.load(Ordering::Relaxed),
            peers_pruned: self.counters.peers_pruned.load(Ordering::Relaxed),
            resubscribes: self.counters.resubscribes.load(Ordering::Relaxed),
        }
    }
}

/// Counter snapshot for metrics export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresenceMetricsSnapshot {
    pub sets: u64,
    pub clears: u64,
    pub local_displacements: u64,
    pub remote_displacements: u64,
    pub renewals: u64,
    pub renewal_failures: u64,
    pub keyspace_events: u64,
    pub prune_runs: u64,
    pub peers_pruned: u64,
    pub resubscribes: u64,
}
