//! Domain Layer
//!
//! Core types with no I/O dependencies.

/// Market data types (keys, snapshots, deltas).
pub mod market;

/// Subscription registry.
pub mod subscription;
