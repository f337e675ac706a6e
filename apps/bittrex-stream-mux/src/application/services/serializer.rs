//! Handshake Serializer
//!
//! Guarantees that at most one two-step subscribe handshake (subscribe-intent
//! followed by snapshot-query) is in flight system-wide, in strict FIFO
//! order. Interleaved subscribe calls would race on shared per-connection
//! handshake state upstream.
//!
//! # Design
//!
//! A single worker task consumes requests from an mpsc queue and performs one
//! handshake at a time; the queue is the pending FIFO and the worker is the
//! idle / handshake-in-flight state machine. Each request carries a oneshot
//! for its outcome. When the orchestrator resets, the worker is cancelled and
//! queued requests resolve to [`SubscribeError::Shutdown`].

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::application::ports::{ConsumerFactory, ConsumerHandle};
use crate::application::services::SubscribeError;
use crate::application::services::pool::Shard;
use crate::domain::market::MarketKey;
use crate::domain::subscription::SubscriptionRegistry;

/// Queue depth for pending handshakes.
const QUEUE_CAPACITY: usize = 256;

struct HandshakeRequest {
    key: MarketKey,
    shard: Arc<Shard>,
    reply: oneshot::Sender<Result<ConsumerHandle, SubscribeError>>,
}

/// FIFO serializer for the two-step subscribe handshake.
pub struct HandshakeSerializer {
    queue: mpsc::Sender<HandshakeRequest>,
}

impl HandshakeSerializer {
    /// Spawn the worker task and return its handle.
    ///
    /// The worker exits when `cancel` fires or every sender is dropped.
    #[must_use]
    pub fn spawn(
        registry: Arc<SubscriptionRegistry<ConsumerHandle>>,
        factory: Arc<dyn ConsumerFactory>,
        cancel: CancellationToken,
    ) -> Self {
        let (queue, rx) = mpsc::channel(QUEUE_CAPACITY);
        tokio::spawn(run_worker(rx, registry, factory, cancel));
        Self { queue }
    }

    /// Enqueue a handshake for `key` on `shard` and await its outcome.
    ///
    /// # Errors
    ///
    /// Returns the handshake failure, [`SubscribeError::ShardStopping`] when
    /// the target shard stopped first, or [`SubscribeError::Shutdown`] when
    /// the orchestrator was reset while the request was queued.
    pub async fn subscribe(
        &self,
        key: MarketKey,
        shard: Arc<Shard>,
    ) -> Result<ConsumerHandle, SubscribeError> {
        let (reply, rx) = oneshot::channel();
        self.queue
            .send(HandshakeRequest { key, shard, reply })
            .await
            .map_err(|_| SubscribeError::Shutdown)?;

        rx.await.unwrap_or(Err(SubscribeError::Shutdown))
    }
}

impl std::fmt::Debug for HandshakeSerializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeSerializer").finish_non_exhaustive()
    }
}

async fn run_worker(
    mut rx: mpsc::Receiver<HandshakeRequest>,
    registry: Arc<SubscriptionRegistry<ConsumerHandle>>,
    factory: Arc<dyn ConsumerFactory>,
    cancel: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            () = cancel.cancelled() => break,
            request = rx.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        let result = perform_handshake(&request.key, &request.shard, &registry, &factory).await;
        let _ = request.reply.send(result);
    }

    tracing::debug!("Handshake serializer stopped");
}

/// Run one two-step handshake to completion.
async fn perform_handshake(
    key: &MarketKey,
    shard: &Arc<Shard>,
    registry: &SubscriptionRegistry<ConsumerHandle>,
    factory: &Arc<dyn ConsumerFactory>,
) -> Result<ConsumerHandle, SubscribeError> {
    if shard.is_stopping() {
        return Err(SubscribeError::ShardStopping);
    }

    // A racing request for the same key may have completed while this one
    // was queued; hand back the existing consumer and free the extra slot.
    if let Some(existing) = registry.get(key) {
        shard.release_slot();
        return Ok(existing);
    }

    // Hold the handshake until the shard's first connect completed.
    shard.wait_ready().await?;

    tracing::debug!(%key, shard = shard.id(), "Starting handshake");

    match shard.connection().subscribe_deltas(key).await {
        Ok(true) => {}
        Ok(false) => {
            rollback(key, shard, registry);
            return Err(SubscribeError::Refused { key: key.clone() });
        }
        Err(source) => {
            rollback(key, shard, registry);
            return Err(SubscribeError::Handshake {
                key: key.clone(),
                source,
            });
        }
    }

    let snapshot = match shard.connection().query_state(key).await {
        Ok(snapshot) => snapshot,
        Err(source) => {
            rollback(key, shard, registry);
            return Err(SubscribeError::Handshake {
                key: key.clone(),
                source,
            });
        }
    };

    let consumer = factory.create(key);
    consumer.apply_snapshot(snapshot);
    shard.add_key(key.clone());
    registry.insert(key.clone(), Arc::clone(&consumer));

    tracing::info!(%key, shard = shard.id(), "Subscribed");
    Ok(consumer)
}

/// Undo the partial effects of a failed handshake so a retry is possible.
fn rollback(
    key: &MarketKey,
    shard: &Arc<Shard>,
    registry: &SubscriptionRegistry<ConsumerHandle>,
) {
    registry.remove(key);
    shard.release_slot();
    tracing::warn!(%key, shard = shard.id(), "Handshake rolled back");
}
