//! Port Interfaces
//!
//! Contracts between the subscription orchestrator and its external
//! collaborators, following the Hexagonal Architecture pattern.
//!
//! ## Driven Ports (Outbound)
//!
//! - [`HubConnector`] / [`HubConnection`]: the push-protocol transport.
//!   Framing, the hub handshake, and low-level socket management live behind
//!   this boundary.
//! - [`BypassFetch`]: acquisition of the anti-automation bypass credential.
//! - [`FeedConsumer`] / [`ConsumerFactory`]: the per-pair order book owner
//!   that ingests one snapshot and then applies deltas.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domain::market::{BookDelta, BookSnapshot, MarketKey};

// =============================================================================
// Bypass Credential
// =============================================================================

/// Opaque gateway bypass credential: the user-agent and cookie pair that the
/// upstream accepts. Created by one fetch and shared read-only thereafter.
#[derive(Clone, PartialEq, Eq)]
pub struct BypassCredential {
    user_agent: String,
    cookie: String,
}

impl BypassCredential {
    /// Create a credential from the fetched header values.
    #[must_use]
    pub fn new(user_agent: impl Into<String>, cookie: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
            cookie: cookie.into(),
        }
    }

    /// User-agent string the gateway challenge was solved with.
    #[must_use]
    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// Cookie header value carrying the clearance token.
    #[must_use]
    pub fn cookie(&self) -> &str {
        &self.cookie
    }
}

impl fmt::Debug for BypassCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BypassCredential")
            .field("user_agent", &self.user_agent)
            .field("cookie", &"[REDACTED]")
            .finish()
    }
}

/// Error acquiring a bypass credential.
///
/// Clonable so the gate can deliver one failure to every queued waiter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BypassError {
    /// The outbound fetch against the gateway failed.
    #[error("bypass fetch failed: {0}")]
    Fetch(String),

    /// The in-flight fetch was torn down before resolving (reset).
    #[error("bypass fetch aborted")]
    Aborted,
}

/// Collaborator that performs one credential fetch against the gateway.
#[async_trait]
pub trait BypassFetch: Send + Sync {
    /// Fetch a fresh bypass credential.
    async fn fetch(&self) -> Result<BypassCredential, BypassError>;
}

// =============================================================================
// Transport
// =============================================================================

/// Error surfaced by the transport collaborator.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Establishing the connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The upstream rejected the request with an HTTP status.
    #[error("upstream rejected request with status {status}")]
    Rejected {
        /// HTTP status code of the rejection.
        status: u16,
    },

    /// The connection closed while an operation was outstanding.
    #[error("connection closed")]
    Closed,

    /// A malformed frame or unexpected payload was received.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A hub invocation returned an error.
    #[error("hub call failed: {0}")]
    Call(String),
}

impl TransportError {
    /// Whether this error indicates the gateway is blocking us again and the
    /// cached bypass credential must be re-acquired.
    #[must_use]
    pub fn is_upstream_block(&self) -> bool {
        matches!(self, Self::Rejected { status: 503 })
    }
}

/// Lifecycle notifications and push messages emitted by one connection.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The connection (re-)established and completed the hub handshake.
    Connected,
    /// The connection dropped.
    Disconnected,
    /// The transport is about to retry the connection.
    Reconnecting {
        /// Retry attempt number since the last successful connect.
        attempt: u32,
    },
    /// The connection faulted.
    Fault {
        /// HTTP status carried by the fault, when one applies.
        status: Option<u16>,
        /// Human-readable description.
        message: String,
    },
    /// A pushed order book delta.
    Push(BookDelta),
}

/// One physical hub connection.
///
/// Implementations own framing and the low-level socket; callers drive the
/// lifecycle (`start`/`stop`) and issue the two handshake-style remote calls.
#[async_trait]
pub trait HubConnection: Send + Sync {
    /// Open the socket and complete the hub handshake. Also used to restart
    /// a dropped connection.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the connection cannot be established.
    async fn start(&self) -> Result<(), TransportError>;

    /// Tear the connection down. Idempotent.
    async fn stop(&self);

    /// Replace the credential headers used by subsequent `start` calls.
    fn apply_credential(&self, credential: &BypassCredential);

    /// Declare subscription intent for a pair (`SubscribeToExchangeDeltas`).
    ///
    /// Returns the upstream acknowledgement; `false` means the hub refused.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the call cannot be delivered.
    async fn subscribe_deltas(&self, key: &MarketKey) -> Result<bool, TransportError>;

    /// Query the full book snapshot for a pair (`QueryExchangeState`).
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the call fails or the hub returns an
    /// empty result.
    async fn query_state(&self, key: &MarketKey) -> Result<BookSnapshot, TransportError>;
}

/// Factory for physical hub connections.
#[async_trait]
pub trait HubConnector: Send + Sync {
    /// Create a connection wired with the given credential headers, plus the
    /// receiver its lifecycle events and push messages arrive on.
    ///
    /// The connection is not started; the caller wires its event loop first
    /// and then calls [`HubConnection::start`].
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the connection object cannot be set up.
    async fn open(
        &self,
        credential: &BypassCredential,
    ) -> Result<(Arc<dyn HubConnection>, mpsc::Receiver<ConnectionEvent>), TransportError>;
}

// =============================================================================
// Feed Consumer
// =============================================================================

/// External entity owning order book reconstruction for one pair.
///
/// The orchestrator guarantees `apply_snapshot` is called exactly once, before
/// any `apply_delta` for the same pair.
pub trait FeedConsumer: Send + Sync {
    /// Pair this consumer reconstructs.
    fn key(&self) -> &MarketKey;

    /// Initialize from the full snapshot returned by the handshake.
    fn apply_snapshot(&self, snapshot: BookSnapshot);

    /// Apply one pushed delta.
    fn apply_delta(&self, delta: BookDelta);
}

/// Shared handle to a feed consumer.
pub type ConsumerHandle = Arc<dyn FeedConsumer>;

/// Creates the feed consumer for a newly subscribed pair.
pub trait ConsumerFactory: Send + Sync {
    /// Create the consumer handle for `key`.
    fn create(&self, key: &MarketKey) -> ConsumerHandle;
}

// =============================================================================
// Tests
// =============================================================================
