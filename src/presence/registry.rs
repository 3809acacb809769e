use parking_lot::Mutex;
use std::collections::HashMap;

use super::listener::DisplacedPresenceListener;

/// Listeners for every connection this process currently terminates, keyed
/// by presence key. Purely in-memory; registry operations never touch the
/// store.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    entries: Mutex<HashMap<String, DisplacedPresenceListener>>,
}

impl PresenceRegistry {
    /// Insert a listener, returning the one it replaced.
    pub fn replace(
        &self,
        key: &str,
        listener: DisplacedPresenceListener,
    ) -> Option<DisplacedPresenceListener> {
        self.entries.lock().insert(key.to_string(), listener)
    }

    pub fn remove(&self, key: &str) -> Option<DisplacedPresenceListener> {
        self.entries.lock().remove(key)
    }

    /// Remove only while the stored listener is `listener` itself. A stale
    /// teardown racing a reconnect must not evict the newer connection's
    /// entry.
    pub fn remove_matching(&self, key: &str, listener: &DisplacedPresenceListener) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(current) if current.same_listener(listener) => {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn tracked_keys(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }

    /// Empty the registry, handing back every entry.
    pub fn drain(&self) -> Vec<(String, DisplacedPresenceListener)> {
        self.entries.lock().drain().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
