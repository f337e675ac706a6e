//! Infrastructure Layer
//!
//! Adapters for the external collaborators the application ports describe.

/// Bittrex adapters: SignalR transport, gateway bypass fetcher, wire types.
pub mod bittrex;

/// Environment-driven configuration.
pub mod config;

/// Tracing initialization.
pub mod telemetry;
