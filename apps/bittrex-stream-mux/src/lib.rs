#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::default_trait_access,
        clippy::items_after_statements
    )
)]

//! Bittrex Stream Mux - Market Data Feed Multiplexer
//!
//! Maintains a bounded pool of SignalR hub connections to Bittrex and
//! multiplexes per-market order book subscriptions across them. The upstream
//! sits behind an anti-automation gateway, so every connection carries a
//! bypass credential acquired once and shared by the whole pool.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core market data types with no external collaborators
//!   - `market`: Market keys, order book snapshots and deltas
//!   - `subscription`: The key → consumer registry
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Interfaces for the transport, bypass fetch, feed consumers
//!   - `services`: Bypass gate, shard pool, handshake serializer, orchestrator
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `bittrex`: SignalR hub client and gateway bypass fetcher
//!   - `config`: Configuration and dependency injection
//!   - `telemetry`: Tracing initialization
//!
//! # Data Flow
//!
//! ```text
//! subscribe(key) ──► bypass gate ──► shard pool ──► handshake serializer
//!                                        │                  │
//!                                   SignalR shards    snapshot + deltas
//!                                        │                  │
//!                                        └──── registry ──► FeedConsumer
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core market data types with no external dependencies.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::market::{BookDelta, BookEntry, BookSnapshot, DeltaEntry, Fill, MarketKey};
pub use domain::subscription::SubscriptionRegistry;

// Ports
pub use application::ports::{
    BypassCredential, BypassError, BypassFetch, ConnectionEvent, ConsumerFactory, ConsumerHandle,
    FeedConsumer, HubConnection, HubConnector, TransportError,
};

// Services
pub use application::services::SubscribeError;
pub use application::services::orchestrator::{FeedOrchestrator, OrchestratorConfig};

// Infrastructure config
pub use infrastructure::config::{ConfigError, MuxConfig};
