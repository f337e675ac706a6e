//! Mux Configuration Settings
//!
//! Configuration types for the stream mux, loaded from environment variables.

use std::time::Duration;

use url::Url;

use crate::application::services::backoff::BackoffConfig;
use crate::application::services::orchestrator::OrchestratorConfig;
use crate::application::services::pool::ShardPoolConfig;
use crate::infrastructure::bittrex::signalr::SignalRConfig;

/// Endpoint settings for the upstream exchange.
#[derive(Debug, Clone)]
pub struct EndpointSettings {
    /// Gateway URL the bypass credential is fetched against.
    pub gateway_url: Url,
    /// SignalR base endpoint.
    pub signalr_url: Url,
    /// Timeout for one hub invocation round-trip.
    pub call_timeout: Duration,
}

impl Default for EndpointSettings {
    // Static URLs; the fallible path is the env override below.
    #[allow(clippy::unwrap_used)]
    fn default() -> Self {
        Self {
            gateway_url: Url::parse("https://bittrex.com/").unwrap(),
            signalr_url: Url::parse("https://socket.bittrex.com/signalr").unwrap(),
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Shard pool settings.
#[derive(Debug, Clone)]
pub struct ShardSettings {
    /// Maximum number of pairs hosted by one connection.
    pub capacity: usize,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Jitter fraction applied to reconnection delays.
    pub reconnect_jitter: f64,
}

impl Default for ShardSettings {
    fn default() -> Self {
        let backoff = BackoffConfig::default();
        Self {
            capacity: 10,
            reconnect_delay_initial: backoff.initial_delay,
            reconnect_delay_max: backoff.max_delay,
            reconnect_delay_multiplier: backoff.multiplier,
            reconnect_jitter: backoff.jitter_factor,
        }
    }
}

/// Complete mux configuration.
#[derive(Debug, Clone, Default)]
pub struct MuxConfig {
    /// Upstream endpoint settings.
    pub endpoints: EndpointSettings,
    /// Shard pool settings.
    pub shard: ShardSettings,
}

impl MuxConfig {
    /// Create configuration from environment variables.
    ///
    /// Every variable has a production default; only malformed overrides
    /// fail.
    ///
    /// # Errors
    ///
    /// Returns an error if a URL override does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = EndpointSettings::default();

        let gateway_url = parse_env_url("BITTREX_GATEWAY_URL", defaults.gateway_url)?;
        let signalr_url = parse_env_url("BITTREX_SIGNALR_URL", defaults.signalr_url)?;

        let endpoints = EndpointSettings {
            gateway_url,
            signalr_url,
            call_timeout: parse_env_duration_secs(
                "BITTREX_CALL_TIMEOUT_SECS",
                defaults.call_timeout,
            ),
        };

        let shard_defaults = ShardSettings::default();
        let shard = ShardSettings {
            capacity: parse_env_usize("BITTREX_SHARD_CAPACITY", shard_defaults.capacity),
            reconnect_delay_initial: parse_env_duration_millis(
                "BITTREX_RECONNECT_DELAY_INITIAL_MS",
                shard_defaults.reconnect_delay_initial,
            ),
            reconnect_delay_max: parse_env_duration_secs(
                "BITTREX_RECONNECT_DELAY_MAX_SECS",
                shard_defaults.reconnect_delay_max,
            ),
            reconnect_delay_multiplier: parse_env_f64(
                "BITTREX_RECONNECT_DELAY_MULTIPLIER",
                shard_defaults.reconnect_delay_multiplier,
            ),
            reconnect_jitter: parse_env_f64(
                "BITTREX_RECONNECT_JITTER",
                shard_defaults.reconnect_jitter,
            ),
        };

        Ok(Self { endpoints, shard })
    }

    /// Orchestrator configuration derived from these settings.
    #[must_use]
    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            pool: ShardPoolConfig {
                shard_capacity: self.shard.capacity,
                backoff: BackoffConfig {
                    initial_delay: self.shard.reconnect_delay_initial,
                    max_delay: self.shard.reconnect_delay_max,
                    multiplier: self.shard.reconnect_delay_multiplier,
                    jitter_factor: self.shard.reconnect_jitter,
                },
            },
        }
    }

    /// SignalR transport configuration derived from these settings.
    #[must_use]
    pub fn signalr(&self) -> SignalRConfig {
        SignalRConfig {
            base_url: self.endpoints.signalr_url.clone(),
            hub: "corehub".to_string(),
            call_timeout: self.endpoints.call_timeout,
            event_capacity: 1024,
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable holds a malformed value.
    #[error("environment variable {key} is invalid: {reason}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Parse failure description.
        reason: String,
    },
}

fn parse_env_url(key: &str, default: Url) -> Result<Url, ConfigError> {
    match std::env::var(key) {
        Ok(value) => Url::parse(&value).map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn parse_env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_duration_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_env_duration_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}
