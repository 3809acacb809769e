use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use super::{
    keyspace_channel, ClusterStore, KeyTtl, PubSubEvent, PubSubSession, PubSubSessionId,
    StoreResult, KEYSPACE_EVENT_DEL, KEYSPACE_EVENT_EXPIRED, KEYSPACE_EVENT_SET,
};
use crate::core::time::Clock;

struct ValueEntry {
    value: String,
    deadline: Option<Instant>,
}

struct Subscriber {
    channels: HashSet<String>,
    tx: mpsc::UnboundedSender<PubSubEvent>,
}

#[derive(Default)]
struct StoreState {
    values: HashMap<String, ValueEntry>,
    sets: HashMap<String, HashSet<String>>,
    subscribers: HashMap<PubSubSessionId, Subscriber>,
    next_session: PubSubSessionId,
}

/// In-process `ClusterStore` with the notification semantics of the real
/// clustered backend: keyspace events on write/delete/expiry, per-session
/// subscriptions, and publish reporting its receiver count.
///
/// Expiry is lazy: an expired entry is dropped (and its `expired` event
/// published) by the first operation that touches it, or by `sweep_expired`.
#[derive(Clone)]
pub struct MemoryClusterStore<C: Clock> {
    state: Arc<Mutex<StoreState>>,
    clock: C,
}

impl<C: Clock> MemoryClusterStore<C> {
    pub fn new(clock: C) -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState::default())),
            clock,
        }
    }

    /// Write a key with no TTL. Not part of the client contract; exists so
    /// tests can model out-of-band writes.
    pub fn set_untimed(&self, key: &str, value: &str) {
        let mut state = self.state.lock();
        state.values.insert(
            key.to_string(),
            ValueEntry {
                value: value.to_string(),
                deadline: None,
            },
        );
        deliver(&mut state, &keyspace_channel(key), KEYSPACE_EVENT_SET);
    }

    /// Force the lazy expiry check across every key. Returns how many
    /// entries were dropped.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let expired: Vec<String> = state
            .values
            .iter()
            .filter(|(_, entry)| entry.deadline.map(|d| now >= d).unwrap_or(false))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            state.values.remove(key);
            deliver(&mut state, &keyspace_channel(key), KEYSPACE_EVENT_EXPIRED);
        }
        expired.len()
    }

    /// Model a cluster topology change: server-side subscription state is
    /// wiped and every session is told to resubscribe.
    pub fn simulate_topology_change(&self) {
        let mut state = self.state.lock();
        for subscriber in state.subscribers.values_mut() {
            subscriber.channels.clear();
            let _ = subscriber.tx.send(PubSubEvent::TopologyChanged);
        }
    }

    /// Model losing every pub/sub connection at once. Each session's event
    /// feed closes, which consumers observe as a dropped connection.
    pub fn drop_pubsub_sessions(&self) {
        let mut state = self.state.lock();
        state.subscribers.clear();
    }

    fn purge_if_expired(&self, state: &mut StoreState, key: &str) {
        let now = self.clock.now();
        let expired = state
            .values
            .get(key)
            .map(|entry| entry.deadline.map(|d| now >= d).unwrap_or(false))
            .unwrap_or(false);
        if expired {
            state.values.remove(key);
            deliver(state, &keyspace_channel(key), KEYSPACE_EVENT_EXPIRED);
        }
    }
}

/// Send to every session subscribed to `channel`, dropping sessions whose
/// receiver is gone. Returns how many sessions got the message.
fn deliver(state: &mut StoreState, channel: &str, payload: &str) -> usize {
    let mut dead = Vec::new();
    let mut delivered = 0;
    for (id, subscriber) in &state.subscribers {
        if !subscriber.channels.contains(channel) {
            continue;
        }
        let event = PubSubEvent::Message {
            channel: channel.to_string(),
            payload: payload.to_string(),
        };
        if subscriber.tx.send(event).is_ok() {
            delivered += 1;
        } else {
            dead.push(*id);
        }
    }
    for id in dead {
        state.subscribers.remove(&id);
    }
    delivered
}

#[async_trait]
impl<C: Clock> ClusterStore for MemoryClusterStore<C> {
    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let deadline = self.clock.now() + ttl;
        let mut state = self.state.lock();
        state.values.insert(
            key.to_string(),
            ValueEntry {
                value: value.to_string(),
                deadline: Some(deadline),
            },
        );
        deliver(&mut state, &keyspace_channel(key), KEYSPACE_EVENT_SET);
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut state = self.state.lock();
        self.purge_if_expired(&mut state, key);
        Ok(state.values.get(key).map(|entry| entry.value.clone()))
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut state = self.state.lock();
        self.purge_if_expired(&mut state, key);
        Ok(state.values.contains_key(key))
    }

    async fn remove(&self, key: &str) -> StoreResult<bool> {
        let mut state = self.state.lock();
        self.purge_if_expired(&mut state, key);
        let removed_value = state.values.remove(key).is_some();
        let removed_set = state.sets.remove(key).is_some();
        let existed = removed_value || removed_set;
        if existed {
            deliver(&mut state, &keyspace_channel(key), KEYSPACE_EVENT_DEL);
        }
        Ok(existed)
    }

    async fn remove_if_value(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let mut state = self.state.lock();
        self.purge_if_expired(&mut state, key);
        let matches = state
            .values
            .get(key)
            .map(|entry| entry.value == expected)
            .unwrap_or(false);
        if matches {
            state.values.remove(key);
            deliver(&mut state, &keyspace_channel(key), KEYSPACE_EVENT_DEL);
        }
        Ok(matches)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let deadline = self.clock.now() + ttl;
        let mut state = self.state.lock();
        self.purge_if_expired(&mut state, key);
        match state.values.get_mut(key) {
            Some(entry) => {
                entry.deadline = Some(deadline);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn expire_if_value(&self, key: &str, expected: &str, ttl: Duration) -> StoreResult<bool> {
        let deadline = self.clock.now() + ttl;
        let mut state = self.state.lock();
        self.purge_if_expired(&mut state, key);
        match state.values.get_mut(key) {
            Some(entry) if entry.value == expected => {
                entry.deadline = Some(deadline);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> StoreResult<KeyTtl> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.purge_if_expired(&mut state, key);
        Ok(match state.values.get(key) {
            None => KeyTtl::Missing,
            Some(ValueEntry { deadline: None, .. }) => KeyTtl::Unset,
            Some(ValueEntry {
                deadline: Some(deadline),
                ..
            }) => KeyTtl::Remaining(deadline.saturating_duration_since(now)),
        })
    }

    async fn set_add(&self, set: &str, member: &str) -> StoreResult<bool> {
        let mut state = self.state.lock();
        Ok(state
            .sets
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn set_remove(&self, set: &str, member: &str) -> StoreResult<bool> {
        let mut state = self.state.lock();
        let removed = state
            .sets
            .get_mut(set)
            .map(|members| members.remove(member))
            .unwrap_or(false);
        if removed && state.sets.get(set).map(HashSet::is_empty).unwrap_or(false) {
            state.sets.remove(set);
        }
        Ok(removed)
    }

    async fn set_contains(&self, set: &str, member: &str) -> StoreResult<bool> {
        let state = self.state.lock();
        Ok(state
            .sets
            .get(set)
            .map(|members| members.contains(member))
            .unwrap_or(false))
    }

    async fn set_members(&self, set: &str) -> StoreResult<Vec<String>> {
        let state = self.state.lock();
        let mut members: Vec<String> = state
            .sets
            .get(set)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        Ok(members)
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<usize> {
        let mut state = self.state.lock();
        Ok(deliver(&mut state, channel, payload))
    }

    async fn connect_pubsub(&self) -> StoreResult<PubSubSession> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        let id = state.next_session;
        state.next_session += 1;
        state.subscribers.insert(
            id,
            Subscriber {
                channels: HashSet::new(),
                tx,
            },
        );
        Ok(PubSubSession { id, events: rx })
    }

    async fn subscribe(&self, session: PubSubSessionId, channel: &str) -> StoreResult<()> {
        let mut state = self.state.lock();
        match state.subscribers.get_mut(&session) {
            Some(subscriber) => {
                subscriber.channels.insert(channel.to_string());
                Ok(())
            }
            None => Err(super::StoreError::SessionClosed),
        }
    }

    async fn unsubscribe(&self, session: PubSubSessionId, channel: &str) -> StoreResult<()> {
        let mut state = self.state.lock();
        match state.subscribers.get_mut(&session) {
            Some(subscriber) => {
                subscriber.channels.remove(channel);
                Ok(())
            }
            None => Err(super::StoreError::SessionClosed),
        }
    }

    async fn disconnect_pubsub(&self, session: PubSubSessionId) -> StoreResult<()> {
        let mut state = self.state.lock();
        state.subscribers.remove(&session);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::time::SystemClock;

    fn store() -> MemoryClusterStore<SystemClock> {
        MemoryClusterStore::new(SystemClock)
    }

    #[tokio::test]
    async fn set_get_overwrite() {
        let store = store();
        store
            .set_with_expiry("k", "a", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("a".to_string()));
        store
            .set_with_expiry("k", "b", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("b".to_string()));
        assert!(store.exists("k").await.unwrap());
        assert!(!store.exists("missing").await.unwrap());
    }

    #[tokio::test]
    async fn conditional_remove_honors_value() {
        let store = store();
        store
            .set_with_expiry("k", "owner-1", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(!store.remove_if_value("k", "owner-2").await.unwrap());
        assert!(store.exists("k").await.unwrap());
        assert!(store.remove_if_value("k", "owner-1").await.unwrap());
        assert!(!store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn conditional_expire_never_creates() {
        let store = store();
        assert!(!store
            .expire_if_value("k", "owner-1", Duration::from_secs(60))
            .await
            .unwrap());
        assert!(!store.exists("k").await.unwrap());
        store.set_untimed("k", "owner-1");
        assert!(!store
            .expire_if_value("k", "owner-2", Duration::from_secs(60))
            .await
            .unwrap());
        assert_eq!(store.ttl("k").await.unwrap(), KeyTtl::Unset);
        assert!(store
            .expire_if_value("k", "owner-1", Duration::from_secs(60))
            .await
            .unwrap());
        assert!(store.ttl("k").await.unwrap().is_positive());
    }

    #[tokio::test]
    async fn unconditional_expire_requires_the_key() {
        let store = store();
        assert!(!store.expire("k", Duration::from_secs(60)).await.unwrap());
        store.set_untimed("k", "v");
        assert!(store.expire("k", Duration::from_secs(60)).await.unwrap());
        assert!(store.ttl("k").await.unwrap().is_positive());
    }

    #[tokio::test]
    async fn ttl_reports_all_states() {
        let store = store();
        assert_eq!(store.ttl("k").await.unwrap(), KeyTtl::Missing);
        store.set_untimed("k", "v");
        assert_eq!(store.ttl("k").await.unwrap(), KeyTtl::Unset);
        store
            .set_with_expiry("k", "v", Duration::from_secs(60))
            .await
            .unwrap();
        match store.ttl("k").await.unwrap() {
            KeyTtl::Remaining(d) => assert!(d <= Duration::from_secs(60) && d > Duration::from_secs(50)),
            other => panic!("unexpected ttl {other:?}"),
        }
    }

    #[tokio::test]
    async fn zero_ttl_expires_on_access() {
        let store = store();
        let mut session = store.connect_pubsub().await.unwrap();
        store
            .subscribe(session.id, &keyspace_channel("k"))
            .await
            .unwrap();
        store
            .set_with_expiry("k", "v", Duration::ZERO)
            .await
            .unwrap();
        assert!(!store.exists("k").await.unwrap());
        // set event then the lazy expiry
        assert_eq!(
            session.events.try_recv().unwrap(),
            PubSubEvent::Message {
                channel: keyspace_channel("k"),
                payload: KEYSPACE_EVENT_SET.to_string()
            }
        );
        assert_eq!(
            session.events.try_recv().unwrap(),
            PubSubEvent::Message {
                channel: keyspace_channel("k"),
                payload: KEYSPACE_EVENT_EXPIRED.to_string()
            }
        );
    }

    #[tokio::test]
    async fn sweep_collects_expired_entries() {
        let store = store();
        store
            .set_with_expiry("a", "v", Duration::ZERO)
            .await
            .unwrap();
        store
            .set_with_expiry("b", "v", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.sweep_expired(), 1);
        assert!(store.exists("b").await.unwrap());
    }

    #[tokio::test]
    async fn remove_emits_del_event() {
        let store = store();
        let mut session = store.connect_pubsub().await.unwrap();
        store
            .subscribe(session.id, &keyspace_channel("k"))
            .await
            .unwrap();
        store
            .set_with_expiry("k", "v", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(store.remove("k").await.unwrap());
        assert!(!store.remove("k").await.unwrap());
        let _set = session.events.try_recv().unwrap();
        assert_eq!(
            session.events.try_recv().unwrap(),
            PubSubEvent::Message {
                channel: keyspace_channel("k"),
                payload: KEYSPACE_EVENT_DEL.to_string()
            }
        );
        assert!(session.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_counts_subscribed_sessions() {
        let store = store();
        let _quiet = store.connect_pubsub().await.unwrap();
        let mut listening = store.connect_pubsub().await.unwrap();
        store.subscribe(listening.id, "ch").await.unwrap();
        assert_eq!(store.publish("ch", "ping").await.unwrap(), 1);
        assert_eq!(store.publish("other", "ping").await.unwrap(), 0);
        assert_eq!(
            listening.events.try_recv().unwrap(),
            PubSubEvent::Message {
                channel: "ch".to_string(),
                payload: "ping".to_string()
            }
        );
        store.unsubscribe(listening.id, "ch").await.unwrap();
        assert_eq!(store.publish("ch", "ping").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn disconnected_session_counts_as_gone() {
        let store = store();
        let session = store.connect_pubsub().await.unwrap();
        store.subscribe(session.id, "ch").await.unwrap();
        store.disconnect_pubsub(session.id).await.unwrap();
        assert_eq!(store.publish("ch", "ping").await.unwrap(), 0);
        assert!(store.subscribe(session.id, "ch").await.is_err());
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned_on_delivery() {
        let store = store();
        let session = store.connect_pubsub().await.unwrap();
        store.subscribe(session.id, "ch").await.unwrap();
        drop(session.events);
        assert_eq!(store.publish("ch", "ping").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn topology_change_wipes_subscriptions() {
        let store = store();
        let mut session = store.connect_pubsub().await.unwrap();
        store.subscribe(session.id, "ch").await.unwrap();
        store.simulate_topology_change();
        assert_eq!(
            session.events.try_recv().unwrap(),
            PubSubEvent::TopologyChanged
        );
        assert_eq!(store.publish("ch", "ping").await.unwrap(), 0);
        store.subscribe(session.id, "ch").await.unwrap();
        assert_eq!(store.publish("ch", "ping").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn dropping_sessions_closes_event_feeds() {
        let store = store();
        let mut session = store.connect_pubsub().await.unwrap();
        store.drop_pubsub_sessions();
        assert_eq!(session.events.recv().await, None);
    }

    #[tokio::test]
    async fn set_operations() {
        let store = store();
        assert!(store.set_add("s", "a").await.unwrap());
        assert!(!store.set_add("s", "a").await.unwrap());
        assert!(store.set_add("s", "b").await.unwrap());
        assert!(store.set_contains("s", "a").await.unwrap());
        assert_eq!(
            store.set_members("s").await.unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );
        assert!(store.set_remove("s", "a").await.unwrap());
        assert!(!store.set_remove("s", "a").await.unwrap());
        assert_eq!(store.set_members("s").await.unwrap(), vec!["b".to_string()]);
    }
}
