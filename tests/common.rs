//! Common test harness utilities for integration tests.
//!
//! This module provides helpers for:
//! - A manually advanced clock
//! - Wiring several managers onto one shared in-memory store
//! - Listeners that record how they were displaced
//!
//! All helpers use only the crate's public API.

// Not all test files use all helpers; silence dead_code warnings for unused exports.
#![allow(dead_code)]

use roster::store::MemoryClusterStore;
use roster::{ClientPresenceManager, Clock, DisplacedPresenceListener, PresenceConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Clone)]
pub struct TestClock {
    now: Arc<Mutex<Instant>>,
}

impl TestClock {
    pub fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn advance(&self, delta: Duration) {
        if let Ok(mut guard) = self.now.lock() {
            *guard += delta;
        }
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap()
    }

    fn sleep(&self, duration: Duration) -> tokio::time::Sleep {
        tokio::time::sleep(duration)
    }
}

/// One clustered store plus the clock it runs on; managers built from it
/// behave like separate processes sharing the cluster.
pub struct TestFleet {
    pub clock: TestClock,
    pub store: MemoryClusterStore<TestClock>,
}

impl TestFleet {
    pub fn new() -> Self {
        let clock = TestClock::new();
        let store = MemoryClusterStore::new(clock.clone());
        Self { clock, store }
    }

    /// Build a manager on this fleet's store without starting it.
    pub fn unstarted_manager(&self) -> ClientPresenceManager<TestClock> {
        ClientPresenceManager::new(
            Arc::new(self.store.clone()),
            PresenceConfig::default(),
            self.clock.clone(),
        )
        .expect("valid default config")
    }

    /// Build and start a manager on this fleet's store.
    pub async fn manager(&self) -> ClientPresenceManager<TestClock> {
        let manager = self.unstarted_manager();
        manager.start().await.expect("manager start");
        manager
    }
}

/// Listener wrapper that counts displacements and how many reported the
/// device as connected elsewhere. `listener()` clones share identity, so the
/// same probe can register a presence and later clear it.
pub struct DisplacementProbe {
    hits: Arc<AtomicUsize>,
    elsewhere_hits: Arc<AtomicUsize>,
    listener: DisplacedPresenceListener,
}

impl DisplacementProbe {
    pub fn new() -> Self {
        let hits = Arc::new(AtomicUsize::new(0));
        let elsewhere_hits = Arc::new(AtomicUsize::new(0));
        let listener = {
            let hits = hits.clone();
            let elsewhere_hits = elsewhere_hits.clone();
            DisplacedPresenceListener::new(move |connected_elsewhere| {
                hits.fetch_add(1, Ordering::SeqCst);
                if connected_elsewhere {
                    elsewhere_hits.fetch_add(1, Ordering::SeqCst);
                }
            })
        };
        Self {
            hits,
            elsewhere_hits,
            listener,
        }
    }

    pub fn listener(&self) -> DisplacedPresenceListener {
        self.listener.clone()
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn elsewhere_hits(&self) -> usize {
        self.elsewhere_hits.load(Ordering::SeqCst)
    }
}

/// Listener that ignores its displacement.
pub fn noop_listener() -> DisplacedPresenceListener {
    DisplacedPresenceListener::new(|_| {})
}

/// Poll `predicate` until it holds or `deadline` passes. Returns the final
/// evaluation, so asserting on the result reports the timeout.
pub async fn wait_until(deadline: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let started = Instant::now();
    while started.elapsed() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    predicate()
}

/// Default polling deadline for eventual-consistency assertions.
pub const SETTLE: Duration = Duration::from_secs(5);
