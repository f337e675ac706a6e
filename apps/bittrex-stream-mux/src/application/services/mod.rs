//! Orchestration Services
//!
//! The components that multiplex logical subscriptions across a bounded pool
//! of hub connections:
//!
//! - [`bypass`]: single-flight acquisition of the gateway bypass credential.
//! - [`backoff`]: restart delay policy for dropped connections.
//! - [`pool`]: shard pool, per-shard lifecycle loop, reconnect replay.
//! - [`serializer`]: system-wide FIFO serialization of the two-step
//!   subscribe handshake.
//! - [`orchestrator`]: the public subscribe/reset surface.

pub mod backoff;
pub mod bypass;
pub mod orchestrator;
pub mod pool;
pub mod serializer;

use crate::application::ports::{BypassError, TransportError};
use crate::domain::market::MarketKey;

/// Error returned to a subscription caller.
///
/// Per the propagation policy, only bypass-acquisition and handshake failures
/// reach callers; transport drops and faults are recovered internally.
#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    /// The bypass credential could not be acquired.
    #[error(transparent)]
    Bypass(#[from] BypassError),

    /// A new shard's connection could not be established.
    #[error("connection setup failed: {source}")]
    Connect {
        /// Underlying transport failure.
        source: TransportError,
    },

    /// A handshake call failed at the transport level.
    #[error("handshake failed for {key}: {source}")]
    Handshake {
        /// Pair the handshake was for.
        key: MarketKey,
        /// Underlying transport failure.
        source: TransportError,
    },

    /// The hub acknowledged the call but refused the subscription.
    #[error("hub refused subscription for {key}")]
    Refused {
        /// Pair the hub refused.
        key: MarketKey,
    },

    /// The target shard was stopped before the handshake could run.
    #[error("shard is stopping")]
    ShardStopping,

    /// The orchestrator was reset or shut down while the request was queued.
    #[error("orchestrator shut down")]
    Shutdown,
}
