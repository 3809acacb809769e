//! Fleet-wide client presence tracking over a shared clustered store.
//!
//! Each process runs one `ClientPresenceManager`. A device's presence is a
//! store record holding the id of the manager that terminates its
//! connection, written last-writer-wins and announced through keyspace
//! notifications; the displaced side reacts by tearing down its local state
//! and firing the connection's displacement listener. Records carry a TTL
//! renewed only while still owned, and a pruner reclaims everything left
//! behind by managers that stopped answering on their liveness channel.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::fmt;
use std::hash::Hasher;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use twox_hash::XxHash64;
use uuid::Uuid;

use super::keys::{
    connected_clients_key, manager_channel, presence_key, DeviceId, MANAGER_SET_KEY,
};
use super::listener::DisplacedPresenceListener;
use super::registry::PresenceRegistry;
use crate::core::config::PresenceConfig;
use crate::core::time::{Clock, SystemClock};
use crate::ops::observability::PresenceMetrics;
use crate::store::{
    key_from_keyspace_channel, keyspace_channel, ClusterStore, PubSubEvent, PubSubSessionId,
    StoreError, StoreResult, KEYSPACE_EVENT_DEL, KEYSPACE_EVENT_EXPIRED, KEYSPACE_EVENT_SET,
};

/// Presence manager for one process in the fleet.
///
/// Clones share all state; hand a clone to each connection handler.
#[derive(Clone)]
pub struct ClientPresenceManager<C: Clock = SystemClock> {
    manager_id: String,
    store: Arc<dyn ClusterStore>,
    config: PresenceConfig,
    clock: C,
    registry: Arc<PresenceRegistry>,
    metrics: PresenceMetrics,
    session_id: Arc<Mutex<Option<PubSubSessionId>>>,
    started: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl<C: Clock> fmt::Debug for ClientPresenceManager<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientPresenceManager")
            .field("manager_id", &self.manager_id)
            .finish_non_exhaustive()
    }
}

impl<C: Clock> ClientPresenceManager<C> {
    pub fn new(store: Arc<dyn ClusterStore>, config: PresenceConfig, clock: C) -> Result<Self> {
        config.validate()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Self {
            manager_id: Uuid::new_v4().to_string(),
            store,
            config,
            clock,
            registry: Arc::new(PresenceRegistry::default()),
            metrics: PresenceMetrics::default(),
            session_id: Arc::new(Mutex::new(None)),
            started: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            shutdown_rx,
            tasks: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn manager_id(&self) -> &str {
        &self.manager_id
    }

    pub fn metrics(&self) -> PresenceMetrics {
        self.metrics.clone()
    }

    /// Number of devices this process currently terminates.
    pub fn local_presence_count(&self) -> usize {
        self.registry.len()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Join the fleet: open the pub/sub session, announce this manager, and
    /// spawn the event, renewal, and prune jobs. Presences registered before
    /// this call get their keyspace subscriptions installed here. Safe to
    /// call twice.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown_tx.send_replace(false);
        let session = self
            .store
            .connect_pubsub()
            .await
            .context("open pub/sub session")?;
        *self.session_id.lock() = Some(session.id);
        self.resubscribe_all()
            .await
            .context("subscribe liveness and presence channels")?;
        self.store
            .set_add(MANAGER_SET_KEY, &self.manager_id)
            .await
            .context("join manager set")?;
        self.spawn_event_loop(session.events);
        self.spawn_renewal_job();
        self.spawn_prune_job();
        tracing::info!("presence manager {} started", self.manager_id);
        Ok(())
    }

    /// Leave the fleet: halt the background jobs, then best-effort flush
    /// every local presence still owned by this manager. Flush failures are
    /// logged and reported but never keep the shutdown from completing.
    pub async fn stop(&self) -> Result<()> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for handle in tasks {
            if let Err(err) = handle.await {
                tracing::warn!("presence task shutdown failed: {err:?}");
            }
        }

        let mut flush_errors: Vec<StoreError> = Vec::new();
        let connected_key = connected_clients_key(&self.manager_id);
        for (key, _listener) in self.registry.drain() {
            if let Err(err) = self.store.remove_if_value(&key, &self.manager_id).await {
                tracing::warn!("presence flush for {key} failed: {err:?}");
                flush_errors.push(err);
            }
            if let Err(err) = self.store.set_remove(&connected_key, &key).await {
                tracing::warn!("connected-set flush for {key} failed: {err:?}");
                flush_errors.push(err);
            }
        }
        if let Err(err) = self.store.set_remove(MANAGER_SET_KEY, &self.manager_id).await {
            tracing::warn!("manager-set departure failed: {err:?}");
            flush_errors.push(err);
        }
        let session = self.session_id.lock().take();
        if let Some(session) = session {
            if let Err(err) = self.store.disconnect_pubsub(session).await {
                tracing::warn!("pub/sub disconnect failed: {err:?}");
                flush_errors.push(err);
            }
        }
        tracing::info!("presence manager {} stopped", self.manager_id);
        match flush_errors.into_iter().next() {
            None => Ok(()),
            Some(err) => Err(anyhow::Error::new(err).context("presence flush incomplete on stop")),
        }
    }

    // ------------------------------------------------------------------
    // Per-device operations
    // ------------------------------------------------------------------

    /// Record that `device` is now connected here. Replaces any previous
    /// local connection for the device (its listener fires with `false`
    /// before this returns) and overwrites any remote owner, which learns
    /// of the takeover through the keyspace channel.
    pub async fn set_present(
        &self,
        account: Uuid,
        device: DeviceId,
        listener: DisplacedPresenceListener,
    ) -> StoreResult<()> {
        let key = presence_key(account, device);
        if let Some(previous) = self.registry.replace(&key, listener) {
            previous.notify(false);
            self.metrics.record_displacement(false);
        }
        let session = *self.session_id.lock();
        if let Some(session) = session {
            self.store
                .subscribe(session, &keyspace_channel(&key))
                .await?;
        }
        self.store
            .set_with_expiry(&key, &self.manager_id, self.config.presence_ttl())
            .await?;
        self.store
            .set_add(&connected_clients_key(&self.manager_id), &key)
            .await?;
        self.store.set_add(MANAGER_SET_KEY, &self.manager_id).await?;
        self.metrics.inc_sets();
        Ok(())
    }

    /// Tear down a presence this connection owns. Returns false without
    /// touching anything when `listener` is not the registered one (a newer
    /// connection owns the entry) or when the record already belongs to
    /// another manager.
    pub async fn clear_presence(
        &self,
        account: Uuid,
        device: DeviceId,
        listener: &DisplacedPresenceListener,
    ) -> StoreResult<bool> {
        let key = presence_key(account, device);
        if !self.registry.remove_matching(&key, listener) {
            return Ok(false);
        }
        let session = *self.session_id.lock();
        if let Some(session) = session {
            if let Err(err) = self.store.unsubscribe(session, &keyspace_channel(&key)).await {
                tracing::warn!("unsubscribe for {key} failed: {err:?}");
            }
        }
        let removed = self.store.remove_if_value(&key, &self.manager_id).await?;
        self.store
            .set_remove(&connected_clients_key(&self.manager_id), &key)
            .await?;
        if removed {
            self.metrics.inc_clears();
        }
        Ok(removed)
    }

    /// Force-close a device's presence no matter which manager owns it.
    /// The owner (possibly this process) reacts to the delete notification.
    pub async fn disconnect_presence(&self, account: Uuid, device: DeviceId) -> StoreResult<()> {
        self.disconnect_all_presence(account, &[device]).await
    }

    /// `disconnect_presence` across several devices of one account.
    pub async fn disconnect_all_presence(
        &self,
        account: Uuid,
        devices: &[DeviceId],
    ) -> StoreResult<()> {
        for device in devices {
            self.store.remove(&presence_key(account, *device)).await?;
        }
        Ok(())
    }

    /// Fleet-wide presence check: one existence probe against the store.
    pub async fn is_present(&self, account: Uuid, device: DeviceId) -> StoreResult<bool> {
        self.store.exists(&presence_key(account, device)).await
    }

    /// Local-only check; never touches the store.
    pub fn is_locally_present(&self, account: Uuid, device: DeviceId) -> bool {
        self.registry.contains(&presence_key(account, device))
    }

    /// Refresh the record's TTL while it is still owned here. Returns false
    /// when the record is gone or belongs to another manager; ownership loss
    /// is reported only through the keyspace channel, never from here.
    pub async fn renew_presence(&self, account: Uuid, device: DeviceId) -> StoreResult<bool> {
        self.renew_key(&presence_key(account, device)).await
    }

    async fn renew_key(&self, key: &str) -> StoreResult<bool> {
        let renewed = self
            .store
            .expire_if_value(key, &self.manager_id, self.config.presence_ttl())
            .await?;
        self.metrics.record_renewal(renewed);
        Ok(renewed)
    }

    async fn renew_local_presences(&self) {
        for key in self.registry.tracked_keys() {
            match self.renew_key(&key).await {
                Ok(_) => {}
                Err(err) => tracing::warn!("presence renewal for {key} failed: {err:?}"),
            }
        }
    }

    // ------------------------------------------------------------------
    // Peer pruning
    // ------------------------------------------------------------------

    /// Reclaim the presence state of peers that no longer answer on their
    /// liveness channel. Normally driven by the prune job; public so
    /// operators and tests can force a pass.
    pub async fn prune_missing_peers(&self) -> StoreResult<()> {
        let peers = self.store.set_members(MANAGER_SET_KEY).await?;
        let mut pruned = 0u64;
        for peer in peers {
            if peer == self.manager_id {
                continue;
            }
            let receivers = self.store.publish(&manager_channel(&peer), "ping").await?;
            if receivers > 0 {
                continue;
            }
            tracing::info!("pruning dead presence manager {peer}");
            let connected_key = connected_clients_key(&peer);
            for key in self.store.set_members(&connected_key).await? {
                // A device may have reconnected through a live manager since
                // the peer died; delete only records the peer still owns.
                self.store.remove_if_value(&key, &peer).await?;
            }
            self.store.remove(&connected_key).await?;
            self.store.set_remove(MANAGER_SET_KEY, &peer).await?;
            pruned += 1;
        }
        self.metrics.record_prune_run(pruned);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Keyspace events
    // ------------------------------------------------------------------

    async fn handle_pubsub_message(&self, channel: &str, payload: &str) {
        let key = match key_from_keyspace_channel(channel) {
            Some(key) => key,
            // Anything else is a peer probing our liveness channel.
            None => return,
        };
        self.metrics.inc_keyspace_events();
        match payload {
            KEYSPACE_EVENT_SET => {
                if !self.registry.contains(key) {
                    return;
                }
                match self.store.get(key).await {
                    Ok(Some(owner)) if owner == self.manager_id => {}
                    Ok(_) => self.displace(key).await,
                    Err(err) => {
                        tracing::warn!("owner check for {key} failed: {err:?}");
                    }
                }
            }
            KEYSPACE_EVENT_DEL | KEYSPACE_EVENT_EXPIRED => {
                if self.registry.contains(key) {
                    self.displace(key).await;
                }
            }
            _ => {}
        }
    }

    /// The device is no longer ours: drop the registry entry, fire its
    /// listener, and clean up the per-key subscription and connected-set
    /// membership. The registry removal makes the listener fire at most
    /// once no matter how many notifications race in.
    async fn displace(&self, key: &str) {
        let listener = match self.registry.remove(key) {
            Some(listener) => listener,
            None => return,
        };
        listener.notify(true);
        self.metrics.record_displacement(true);
        tracing::debug!("presence {key} displaced");
        let session = *self.session_id.lock();
        if let Some(session) = session {
            if let Err(err) = self.store.unsubscribe(session, &keyspace_channel(key)).await {
                tracing::warn!("unsubscribe for {key} failed: {err:?}");
            }
        }
        if let Err(err) = self
            .store
            .set_remove(&connected_clients_key(&self.manager_id), key)
            .await
        {
            tracing::warn!("connected-set cleanup for {key} failed: {err:?}");
        }
    }

    /// Subscribe the current session to the liveness channel and to every
    /// locally tracked presence key.
    async fn resubscribe_all(&self) -> StoreResult<()> {
        let session = match *self.session_id.lock() {
            Some(session) => session,
            None => return Ok(()),
        };
        self.store
            .subscribe(session, &manager_channel(&self.manager_id))
            .await?;
        for key in self.registry.tracked_keys() {
            self.store.subscribe(session, &keyspace_channel(&key)).await?;
        }
        self.metrics.inc_resubscribes();
        Ok(())
    }

    /// Open a fresh pub/sub session after the previous one dropped and
    /// restore every subscription. Sleeps the backoff before dialing.
    async fn reconnect_pubsub(&self) -> StoreResult<mpsc::UnboundedReceiver<PubSubEvent>> {
        self.clock.sleep(self.config.reconnect_backoff()).await;
        let session = self.store.connect_pubsub().await?;
        *self.session_id.lock() = Some(session.id);
        self.resubscribe_all().await?;
        tracing::info!("pub/sub session reopened for manager {}", self.manager_id);
        Ok(session.events)
    }

    // ------------------------------------------------------------------
    // Background jobs
    // ------------------------------------------------------------------

    fn spawn_event_loop(&self, events: mpsc::UnboundedReceiver<PubSubEvent>) {
        if Handle::try_current().is_err() {
            return;
        }
        let this = self.clone();
        let mut shutdown = self.shutdown_rx.clone();
        let handle = tokio::spawn(async move {
            let mut events = events;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    event = events.recv() => match event {
                        Some(PubSubEvent::Message { channel, payload }) => {
                            this.handle_pubsub_message(&channel, &payload).await;
                        }
                        Some(PubSubEvent::TopologyChanged) => {
                            if let Err(err) = this.resubscribe_all().await {
                                tracing::warn!("resubscribe after topology change failed: {err:?}");
                            }
                        }
                        None => match this.reconnect_pubsub().await {
                            Ok(reopened) => events = reopened,
                            Err(err) => {
                                tracing::warn!("pub/sub reconnect failed: {err:?}");
                            }
                        },
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    fn spawn_renewal_job(&self) {
        if Handle::try_current().is_err() {
            return;
        }
        let this = self.clone();
        let mut shutdown = self.shutdown_rx.clone();
        let interval = self.config.renewal_interval();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = this.clock.sleep(interval) => {
                        this.renew_local_presences().await;
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    fn spawn_prune_job(&self) {
        if Handle::try_current().is_err() {
            return;
        }
        let this = self.clone();
        let mut shutdown = self.shutdown_rx.clone();
        let interval = self.config.prune_interval();
        // Spread fleet restarts across the interval instead of having every
        // manager prune in lockstep.
        let initial_delay = prune_start_jitter(&self.manager_id, interval);
        let handle = tokio::spawn(async move {
            let mut delay = initial_delay;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = this.clock.sleep(delay) => {
                        if let Err(err) = this.prune_missing_peers().await {
                            tracing::warn!("peer prune pass failed: {err:?}");
                        }
                        delay = interval;
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }
}

fn prune_start_jitter(manager_id: &str, interval: Duration) -> Duration {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(manager_id.as_bytes());
    Duration::from_secs(hasher.finish() % interval.as_secs().max(1))
}
