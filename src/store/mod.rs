//! Clustered key-value store contract.
//!
//! This module defines the seam between presence tracking and the shared
//! store backing it:
//! - `ClusterStore` - async trait every backend implements
//! - `memory` - in-process implementation for tests and single-node use

pub mod memory;

pub use memory::MemoryClusterStore;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Channel prefix for keyspace notifications. An event about key `K` is
/// published on `__keyspace@0__:K` with a payload naming the event.
pub const KEYSPACE_PREFIX: &str = "__keyspace@0__:";

/// Keyspace event payload for a key write.
pub const KEYSPACE_EVENT_SET: &str = "set";
/// Keyspace event payload for an explicit delete.
pub const KEYSPACE_EVENT_DEL: &str = "del";
/// Keyspace event payload for a TTL expiry.
pub const KEYSPACE_EVENT_EXPIRED: &str = "expired";

/// Notification channel for a single key.
pub fn keyspace_channel(key: &str) -> String {
    format!("{KEYSPACE_PREFIX}{key}")
}

/// Recover the key from a keyspace notification channel name.
pub fn key_from_keyspace_channel(channel: &str) -> Option<&str> {
    channel.strip_prefix(KEYSPACE_PREFIX)
}

/// Errors surfaced by a store backend.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("pub/sub session closed")]
    SessionClosed,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Remaining lifetime of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// Key does not exist.
    Missing,
    /// Key exists with no expiry set.
    Unset,
    /// Key expires after this long.
    Remaining(Duration),
}

impl KeyTtl {
    pub fn is_positive(self) -> bool {
        matches!(self, KeyTtl::Remaining(d) if d > Duration::ZERO)
    }
}

/// Identifier for one pub/sub session on a store.
pub type PubSubSessionId = u64;

/// Events delivered to a pub/sub session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PubSubEvent {
    /// A message published to a channel this session subscribes to.
    Message { channel: String, payload: String },
    /// Cluster topology changed. Server-side subscription state is gone and
    /// every channel must be subscribed again.
    TopologyChanged,
}

/// A live pub/sub session: its id plus the event feed.
#[derive(Debug)]
pub struct PubSubSession {
    pub id: PubSubSessionId,
    pub events: mpsc::UnboundedReceiver<PubSubEvent>,
}

/// Client contract of the shared clustered key-value store.
///
/// String keys and values throughout. The conditional operations
/// (`remove_if_value`, `expire_if_value`) must be atomic with respect to
/// every other operation on the same key; real backends script them,
/// the in-memory store runs them under its lock.
#[async_trait]
pub trait ClusterStore: Send + Sync + 'static {
    /// Unconditional write with a TTL. Publishes a `set` keyspace event.
    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;
    /// Single round-trip existence probe.
    async fn exists(&self, key: &str) -> StoreResult<bool>;
    /// Unconditional delete. True if the key existed; publishes a `del`
    /// keyspace event when it did.
    async fn remove(&self, key: &str) -> StoreResult<bool>;
    /// Delete only while the key still holds `expected`.
    async fn remove_if_value(&self, key: &str, expected: &str) -> StoreResult<bool>;
    /// Set or overwrite the TTL of an existing key. False if missing.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;
    /// Refresh the TTL only while the key still holds `expected`. Never
    /// creates a key.
    async fn expire_if_value(&self, key: &str, expected: &str, ttl: Duration) -> StoreResult<bool>;
    async fn ttl(&self, key: &str) -> StoreResult<KeyTtl>;

    async fn set_add(&self, set: &str, member: &str) -> StoreResult<bool>;
    async fn set_remove(&self, set: &str, member: &str) -> StoreResult<bool>;
    async fn set_contains(&self, set: &str, member: &str) -> StoreResult<bool>;
    async fn set_members(&self, set: &str) -> StoreResult<Vec<String>>;

    /// Publish to a channel; returns how many sessions received the message.
    /// The count is load-bearing: peers probe each other's liveness channels
    /// and treat zero receivers as death.
    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<usize>;

    async fn connect_pubsub(&self) -> StoreResult<PubSubSession>;
    async fn subscribe(&self, session: PubSubSessionId, channel: &str) -> StoreResult<()>;
    async fn unsubscribe(&self, session: PubSubSessionId, channel: &str) -> StoreResult<()>;
    async fn disconnect_pubsub(&self, session: PubSubSessionId) -> StoreResult<()>;
}
