//! Configuration Module
//!
//! Configuration loading and dependency injection for the mux service.

mod settings;

pub use settings::{ConfigError, EndpointSettings, MuxConfig, ShardSettings};
