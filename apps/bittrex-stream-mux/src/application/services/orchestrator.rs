//! Feed Orchestrator
//!
//! Public surface of the subscription system. Callers ask for a market by
//! key and get back the feed-consumer handle; the orchestrator hides the
//! bypass credential, shard selection, handshake serialization, and
//! reconnect recovery behind that one call.
//!
//! All mutable orchestration state (gate, pool, registry, serializer) lives
//! in one owned `Inner` value; `reset()` swaps in a fresh one and tears the
//! old one down, rather than clearing ambient globals.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{
    BypassFetch, ConsumerFactory, ConsumerHandle, HubConnector,
};
use crate::application::services::SubscribeError;
use crate::application::services::bypass::BypassGate;
use crate::application::services::pool::{ShardPool, ShardPoolConfig};
use crate::application::services::serializer::HandshakeSerializer;
use crate::domain::market::MarketKey;
use crate::domain::subscription::SubscriptionRegistry;

/// Configuration for the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    /// Shard pool settings (per-shard capacity, restart backoff).
    pub pool: ShardPoolConfig,
}

struct Inner {
    gate: Arc<BypassGate>,
    registry: Arc<SubscriptionRegistry<ConsumerHandle>>,
    pool: Arc<ShardPool>,
    serializer: HandshakeSerializer,
    cancel: CancellationToken,
}

impl Inner {
    fn new(
        connector: &Arc<dyn HubConnector>,
        fetcher: &Arc<dyn BypassFetch>,
        factory: &Arc<dyn ConsumerFactory>,
        config: &OrchestratorConfig,
    ) -> Self {
        let cancel = CancellationToken::new();
        let gate = Arc::new(BypassGate::new(Arc::clone(fetcher)));
        let registry = Arc::new(SubscriptionRegistry::new());
        let pool = Arc::new(ShardPool::new(
            Arc::clone(connector),
            Arc::clone(&gate),
            Arc::clone(&registry),
            config.pool.clone(),
            cancel.clone(),
        ));
        let serializer = HandshakeSerializer::spawn(
            Arc::clone(&registry),
            Arc::clone(factory),
            cancel.clone(),
        );

        Self {
            gate,
            registry,
            pool,
            serializer,
            cancel,
        }
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
        self.pool.stop_all().await;
        self.registry.clear();
    }
}

/// Subscription orchestrator over a pool of sharded hub connections.
pub struct FeedOrchestrator {
    connector: Arc<dyn HubConnector>,
    fetcher: Arc<dyn BypassFetch>,
    factory: Arc<dyn ConsumerFactory>,
    config: OrchestratorConfig,
    inner: RwLock<Inner>,
    /// Clone of the live `Inner`'s cancel token, reachable without the
    /// `inner` lock so `reset()` can fire it while subscribes hold read
    /// guards.
    cancel: Mutex<CancellationToken>,
}

impl FeedOrchestrator {
    /// Create an orchestrator over the given collaborators.
    #[must_use]
    pub fn new(
        connector: Arc<dyn HubConnector>,
        fetcher: Arc<dyn BypassFetch>,
        factory: Arc<dyn ConsumerFactory>,
        config: OrchestratorConfig,
    ) -> Self {
        let inner = Inner::new(&connector, &fetcher, &factory, &config);
        let cancel = Mutex::new(inner.cancel.clone());
        Self {
            connector,
            fetcher,
            factory,
            config,
            inner: RwLock::new(inner),
            cancel,
        }
    }

    /// Get or create the subscription for a market.
    ///
    /// Idempotent: an already subscribed key returns its existing handle
    /// without a new handshake. Otherwise: ensure a bypass credential,
    /// assign a shard, and run the serialized two-step handshake; the new
    /// consumer is initialized with the returned snapshot before push
    /// deltas are routed to it.
    ///
    /// # Errors
    ///
    /// Returns [`SubscribeError`] on credential-acquisition or handshake
    /// failure. Failures roll back all partial state, so a retry for the
    /// same key is possible.
    pub async fn subscribe(&self, key: MarketKey) -> Result<ConsumerHandle, SubscribeError> {
        let inner = self.inner.read().await;

        inner.gate.ensure().await?;

        if let Some(existing) = inner.registry.get(&key) {
            return Ok(existing);
        }

        let shard = inner.pool.assign().await?;
        inner.serializer.subscribe(key, shard).await
    }

    /// Stop every shard and clear all in-memory state.
    ///
    /// Idempotent. A subsequent [`subscribe`](Self::subscribe) performs a
    /// full bootstrap: fresh credential, fresh shard, fresh handshake.
    pub async fn reset(&self) {
        let fresh = Inner::new(&self.connector, &self.fetcher, &self.factory, &self.config);

        // Fire the live token before taking the write lock: a subscribe in
        // flight holds the read guard across its handshake and releases it
        // only once its shard's stop token (a child of this one) unblocks
        // the wait.
        self.cancel.lock().cancel();

        let old = {
            let mut inner = self.inner.write().await;
            *self.cancel.lock() = fresh.cancel.clone();
            std::mem::replace(&mut *inner, fresh)
        };
        old.shutdown().await;
        tracing::info!("Orchestrator reset");
    }

    /// Whether a market currently has a registered subscription.
    pub async fn is_subscribed(&self, key: &MarketKey) -> bool {
        self.inner.read().await.registry.contains(key)
    }

    /// Number of registered subscriptions.
    pub async fn subscription_count(&self) -> usize {
        self.inner.read().await.registry.len()
    }

    /// Number of live shards.
    pub async fn shard_count(&self) -> usize {
        self.inner.read().await.pool.shard_count().await
    }
}

impl std::fmt::Debug for FeedOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedOrchestrator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
