//! Application Layer
//!
//! Port definitions and the orchestration services built on them.

/// Port interfaces for the transport, the bypass fetcher, and feed consumers.
pub mod ports;

/// Orchestration services: bypass gate, shard pool, handshake serializer,
/// and the public orchestrator surface.
pub mod services;
