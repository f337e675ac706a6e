//! Shard Pool
//!
//! Owns the growable set of physical hub connections ("shards") and decides
//! which shard hosts each new logical subscription: the most recently created
//! shard is reused until it reaches the configured per-shard capacity, then a
//! new shard is allocated.
//!
//! Each shard runs an event loop that reacts to its connection's lifecycle:
//! the first successful connect signals readiness to the handshake
//! serializer; later connects replay the shard's known subscriptions without
//! re-querying snapshots; drops restart the connection on the backoff
//! schedule; faults tear the connection down and restart it only once a
//! bypass credential is confirmed available again.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::RwLock;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::application::ports::{
    ConnectionEvent, ConsumerHandle, HubConnection, HubConnector,
};
use crate::application::services::SubscribeError;
use crate::application::services::backoff::{BackoffConfig, RestartPolicy};
use crate::application::services::bypass::BypassGate;
use crate::domain::market::MarketKey;
use crate::domain::subscription::SubscriptionRegistry;

// =============================================================================
// Shard
// =============================================================================

/// One physical connection hosting a bounded number of subscriptions.
pub struct Shard {
    id: u64,
    connection: Arc<dyn HubConnection>,
    capacity: usize,
    /// Slots taken by held keys plus in-flight handshakes.
    reserved: AtomicUsize,
    /// Keys with a completed handshake, in subscription order.
    keys: RwLock<Vec<MarketKey>>,
    ever_connected: AtomicBool,
    stop: CancellationToken,
    ready_rx: watch::Receiver<bool>,
}

impl Shard {
    fn new(
        id: u64,
        connection: Arc<dyn HubConnection>,
        capacity: usize,
        stop: CancellationToken,
        ready_rx: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            connection,
            capacity,
            reserved: AtomicUsize::new(0),
            keys: RwLock::new(Vec::new()),
            ever_connected: AtomicBool::new(false),
            stop,
            ready_rx,
        })
    }

    /// Shard identifier (creation order).
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The shard's connection handle.
    #[must_use]
    pub fn connection(&self) -> &Arc<dyn HubConnection> {
        &self.connection
    }

    /// Whether the shard has been intentionally stopped.
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Token cancelled when the shard stops.
    #[must_use]
    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    /// Keys with a completed handshake, in subscription order.
    #[must_use]
    pub fn subscribed_keys(&self) -> Vec<MarketKey> {
        self.keys.read().clone()
    }

    /// Slots currently reserved (held keys plus in-flight handshakes).
    #[must_use]
    pub fn reserved_slots(&self) -> usize {
        self.reserved.load(Ordering::SeqCst)
    }

    /// Reserve a subscription slot if capacity remains.
    fn try_reserve(&self) -> bool {
        let mut current = self.reserved.load(Ordering::SeqCst);
        loop {
            if current >= self.capacity {
                return false;
            }
            match self.reserved.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Give back a reserved slot after a failed handshake.
    pub(crate) fn release_slot(&self) {
        let previous = self.reserved.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "slot released without reservation");
    }

    /// Record a key after its handshake completed.
    pub(crate) fn add_key(&self, key: MarketKey) {
        let mut keys = self.keys.write();
        if !keys.contains(&key) {
            keys.push(key);
        }
    }

    /// Wait until the shard's first connect completed.
    ///
    /// # Errors
    ///
    /// Returns [`SubscribeError::ShardStopping`] if the shard is stopped
    /// before it ever connects.
    pub async fn wait_ready(&self) -> Result<(), SubscribeError> {
        let mut ready = self.ready_rx.clone();
        tokio::select! {
            () = self.stop.cancelled() => Err(SubscribeError::ShardStopping),
            changed = ready.wait_for(|connected| *connected) => {
                changed.map(|_| ()).map_err(|_| SubscribeError::ShardStopping)
            }
        }
    }

    /// Re-issue the push subscription for every held key after a reconnect.
    ///
    /// Snapshots are not re-queried: the feed consumers already hold state
    /// and only need delta continuity restored.
    async fn replay_subscriptions(&self) {
        let keys = self.subscribed_keys();
        tracing::info!(shard = self.id, keys = keys.len(), "Replaying subscriptions");

        for key in keys {
            match self.connection.subscribe_deltas(&key).await {
                Ok(true) => tracing::debug!(shard = self.id, %key, "Subscription replayed"),
                Ok(false) => {
                    tracing::warn!(shard = self.id, %key, "Hub refused subscription replay");
                }
                Err(error) => {
                    tracing::warn!(shard = self.id, %key, %error, "Subscription replay failed");
                }
            }
        }
    }
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("reserved", &self.reserved_slots())
            .field("stopping", &self.is_stopping())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Shard Event Loop
// =============================================================================

/// Per-shard reaction loop over the connection's lifecycle events.
///
/// Exits permanently once the shard's stop token is cancelled; every reaction
/// after that point is suppressed, including push delivery.
async fn run_shard_events(
    shard: Arc<Shard>,
    mut events: mpsc::Receiver<ConnectionEvent>,
    ready_tx: watch::Sender<bool>,
    gate: Arc<BypassGate>,
    registry: Arc<SubscriptionRegistry<ConsumerHandle>>,
    backoff: BackoffConfig,
) {
    let mut policy = RestartPolicy::new(backoff);

    loop {
        let event = tokio::select! {
            () = shard.stop.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            ConnectionEvent::Connected => {
                policy.reset();
                if shard.ever_connected.swap(true, Ordering::SeqCst) {
                    shard.replay_subscriptions().await;
                } else {
                    tracing::info!(shard = shard.id, "Shard connected");
                    let _ = ready_tx.send(true);
                }
            }
            ConnectionEvent::Disconnected => {
                tracing::warn!(shard = shard.id, "Shard disconnected, restarting");
                if restart_connection(&shard, &gate, &mut policy, false).await {
                    break;
                }
            }
            ConnectionEvent::Reconnecting { attempt } => {
                // Transport-level retry; let it proceed.
                tracing::debug!(shard = shard.id, attempt, "Shard reconnect attempt");
            }
            ConnectionEvent::Fault { status, message } => {
                tracing::warn!(shard = shard.id, ?status, %message, "Shard fault");
                shard.connection.stop().await;
                let blocked = status == Some(503);
                if restart_connection(&shard, &gate, &mut policy, blocked).await {
                    break;
                }
            }
            ConnectionEvent::Push(delta) => match delta.key() {
                Ok(key) => {
                    if let Some(consumer) = registry.get(&key) {
                        consumer.apply_delta(delta);
                    } else {
                        tracing::debug!(shard = shard.id, %key, "No consumer registered, dropping push");
                    }
                }
                Err(error) => {
                    tracing::debug!(shard = shard.id, %error, "Dropping push with malformed key");
                }
            },
        }
    }

    tracing::debug!(shard = shard.id, "Shard event loop stopped");
}

/// Restart the shard's connection, retrying on the backoff schedule.
///
/// When the drop was caused by an upstream block, the cached credential is
/// invalidated first and the restart waits until a fresh credential is
/// confirmed available. Returns `true` if the shard was stopped while
/// restarting.
async fn restart_connection(
    shard: &Arc<Shard>,
    gate: &Arc<BypassGate>,
    policy: &mut RestartPolicy,
    mut blocked: bool,
) -> bool {
    loop {
        if blocked {
            gate.invalidate().await;
            blocked = false;
        }

        let delay = policy.next_delay();
        tokio::select! {
            () = shard.stop.cancelled() => return true,
            () = tokio::time::sleep(delay) => {}
        }

        // No restart without a confirmed credential: a failed acquisition
        // re-enters the backoff loop instead of starting with stale headers.
        match gate.ensure().await {
            Ok(credential) => shard.connection.apply_credential(&credential),
            Err(error) => {
                tracing::error!(shard = shard.id, %error, "Credential re-acquisition failed");
                continue;
            }
        }

        match shard.connection.start().await {
            Ok(()) => return false,
            Err(error) => {
                blocked = error.is_upstream_block();
                tracing::warn!(
                    shard = shard.id,
                    %error,
                    attempt = policy.attempt_count(),
                    "Shard restart failed"
                );
            }
        }
    }
}

// =============================================================================
// Shard Pool
// =============================================================================

/// Configuration for the shard pool.
#[derive(Debug, Clone)]
pub struct ShardPoolConfig {
    /// Maximum number of keys hosted by one shard.
    pub shard_capacity: usize,
    /// Restart backoff for dropped connections.
    pub backoff: BackoffConfig,
}

impl Default for ShardPoolConfig {
    fn default() -> Self {
        Self {
            shard_capacity: 10,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Growable pool of hub connections.
pub struct ShardPool {
    connector: Arc<dyn HubConnector>,
    gate: Arc<BypassGate>,
    registry: Arc<SubscriptionRegistry<ConsumerHandle>>,
    config: ShardPoolConfig,
    cancel: CancellationToken,
    shards: Mutex<Vec<Arc<Shard>>>,
    next_id: AtomicU64,
}

impl ShardPool {
    /// Create an empty pool.
    ///
    /// `cancel` is the orchestrator-wide token; every shard stops when it is
    /// cancelled.
    #[must_use]
    pub fn new(
        connector: Arc<dyn HubConnector>,
        gate: Arc<BypassGate>,
        registry: Arc<SubscriptionRegistry<ConsumerHandle>>,
        config: ShardPoolConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            connector,
            gate,
            registry,
            config,
            cancel,
            shards: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Assign a shard for one new subscription, reserving a slot on it.
    ///
    /// The most recently created shard is reused while it has spare
    /// capacity; otherwise a new shard is created, wired, and started.
    ///
    /// # Errors
    ///
    /// Returns [`SubscribeError`] when no credential can be acquired or the
    /// new connection cannot be established.
    pub async fn assign(&self) -> Result<Arc<Shard>, SubscribeError> {
        let mut shards = self.shards.lock().await;

        if let Some(current) = shards.last() {
            if !current.is_stopping() && current.try_reserve() {
                return Ok(Arc::clone(current));
            }
        }

        let credential = self.gate.ensure().await?;
        let (connection, events) = self
            .connector
            .open(&credential)
            .await
            .map_err(|source| SubscribeError::Connect { source })?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (ready_tx, ready_rx) = watch::channel(false);
        let shard = Shard::new(
            id,
            Arc::clone(&connection),
            self.config.shard_capacity,
            self.cancel.child_token(),
            ready_rx,
        );
        let reserved = shard.try_reserve();
        debug_assert!(reserved, "fresh shard must have capacity");

        tracing::info!(shard = id, capacity = self.config.shard_capacity, "Creating shard");

        tokio::spawn(run_shard_events(
            Arc::clone(&shard),
            events,
            ready_tx,
            Arc::clone(&self.gate),
            Arc::clone(&self.registry),
            self.config.backoff.clone(),
        ));

        if let Err(source) = connection.start().await {
            shard.stop.cancel();
            connection.stop().await;
            return Err(SubscribeError::Connect { source });
        }

        shards.push(Arc::clone(&shard));
        Ok(shard)
    }

    /// Number of shards created and not yet reset.
    pub async fn shard_count(&self) -> usize {
        self.shards.lock().await.len()
    }

    /// Snapshot of the pool's shards.
    pub async fn shards(&self) -> Vec<Arc<Shard>> {
        self.shards.lock().await.clone()
    }

    /// Stop every shard: cancel its reactions and tear down its connection.
    pub async fn stop_all(&self) {
        let shards = std::mem::take(&mut *self.shards.lock().await);
        for shard in shards {
            shard.stop.cancel();
            shard.connection.stop().await;
        }
    }
}

impl std::fmt::Debug for ShardPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardPool")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::application::ports::{
        BypassCredential, BypassError, BypassFetch, TransportError,
    };
    use crate::domain::market::BookSnapshot;

    struct StaticFetcher;

    #[async_trait]
    impl BypassFetch for StaticFetcher {
        async fn fetch(&self) -> Result<BypassCredential, BypassError> {
            Ok(BypassCredential::new("agent", "cookie"))
        }
    }

    struct FakeConnection {
        event_tx: mpsc::Sender<ConnectionEvent>,
    }

    #[async_trait]
    impl HubConnection for FakeConnection {
        async fn start(&self) -> Result<(), TransportError> {
            let _ = self.event_tx.send(ConnectionEvent::Connected).await;
            Ok(())
        }

        async fn stop(&self) {}

        fn apply_credential(&self, _credential: &BypassCredential) {}

        async fn subscribe_deltas(&self, _key: &MarketKey) -> Result<bool, TransportError> {
            Ok(true)
        }

        async fn query_state(&self, _key: &MarketKey) -> Result<BookSnapshot, TransportError> {
            Ok(BookSnapshot::default())
        }
    }

    struct FakeConnector;

    #[async_trait]
    impl HubConnector for FakeConnector {
        async fn open(
            &self,
            _credential: &BypassCredential,
        ) -> Result<(Arc<dyn HubConnection>, mpsc::Receiver<ConnectionEvent>), TransportError>
        {
            let (event_tx, event_rx) = mpsc::channel(64);
            Ok((Arc::new(FakeConnection { event_tx }), event_rx))
        }
    }

    fn pool(capacity: usize) -> ShardPool {
        let gate = Arc::new(BypassGate::new(Arc::new(StaticFetcher)));
        let registry = Arc::new(SubscriptionRegistry::new());
        ShardPool::new(
            Arc::new(FakeConnector),
            gate,
            registry,
            ShardPoolConfig {
                shard_capacity: capacity,
                backoff: BackoffConfig::default(),
            },
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn reuses_current_shard_until_capacity() {
        let pool = pool(3);

        let first = pool.assign().await.unwrap();
        let second = pool.assign().await.unwrap();
        let third = pool.assign().await.unwrap();

        assert_eq!(first.id(), second.id());
        assert_eq!(second.id(), third.id());
        assert_eq!(pool.shard_count().await, 1);
        assert_eq!(first.reserved_slots(), 3);
    }

    #[tokio::test]
    async fn allocates_new_shard_past_capacity() {
        let pool = pool(2);

        let a = pool.assign().await.unwrap();
        let _b = pool.assign().await.unwrap();
        let c = pool.assign().await.unwrap();

        assert_ne!(a.id(), c.id());
        assert_eq!(pool.shard_count().await, 2);
        assert_eq!(a.reserved_slots(), 2);
        assert_eq!(c.reserved_slots(), 1);
    }

    #[tokio::test]
    async fn released_slot_frees_capacity() {
        let pool = pool(1);

        let a = pool.assign().await.unwrap();
        a.release_slot();
        let b = pool.assign().await.unwrap();

        // Slot was given back, so the same shard is reused.
        assert_eq!(a.id(), b.id());
        assert_eq!(pool.shard_count().await, 1);
    }

    #[tokio::test]
    async fn stop_all_empties_pool_and_stops_shards() {
        let pool = pool(1);
        let shard = pool.assign().await.unwrap();

        pool.stop_all().await;
        assert!(shard.is_stopping());
        assert_eq!(pool.shard_count().await, 0);
    }

    #[tokio::test]
    async fn shard_becomes_ready_after_first_connect() {
        let pool = pool(2);
        let shard = pool.assign().await.unwrap();
        shard.wait_ready().await.unwrap();
    }

    #[tokio::test]
    async fn wait_ready_fails_on_stopped_shard() {
        let pool = pool(2);
        let shard = pool.assign().await.unwrap();
        shard.stop_token().cancel();
        // The ready signal may have won the race; only a stopped, never-ready
        // shard must error.
        if !*shard.ready_rx.clone().borrow() {
            assert!(matches!(
                shard.wait_ready().await,
                Err(SubscribeError::ShardStopping)
            ));
        }
    }

    #[test]
    fn add_key_is_idempotent() {
        let (_tx, ready_rx) = watch::channel(false);
        let (event_tx, _event_rx) = mpsc::channel(1);
        let shard = Shard::new(
            0,
            Arc::new(FakeConnection { event_tx }),
            4,
            CancellationToken::new(),
            ready_rx,
        );

        let key = MarketKey::new("BTC-ETH").unwrap();
        shard.add_key(key.clone());
        shard.add_key(key.clone());
        assert_eq!(shard.subscribed_keys(), vec![key]);
    }
}
