//! Tracing Initialization
//!
//! Configures the `tracing` subscriber for the mux service.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: standard `EnvFilter` directives (take precedence)
//! - `LOG_FORMAT`: set to "json" for machine-readable output (default: text)

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Default filter applied when `RUST_LOG` is unset.
const DEFAULT_DIRECTIVES: &str = "bittrex_stream_mux=info,tokio_tungstenite=warn,tungstenite=warn";

/// Telemetry configuration.
#[derive(Debug, Clone, Default)]
pub struct TelemetryConfig {
    /// Emit JSON log lines instead of human-readable text.
    pub json: bool,
}

impl TelemetryConfig {
    /// Create configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let json = std::env::var("LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        Self { json }
    }
}

/// Initialize tracing with configuration from the environment.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init() {
    init_with_config(&TelemetryConfig::from_env());
}

/// Initialize tracing with custom configuration.
pub fn init_with_config(config: &TelemetryConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };

    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_text() {
        assert!(!TelemetryConfig::default().json);
    }

    #[test]
    fn init_is_idempotent() {
        init_with_config(&TelemetryConfig::default());
        init_with_config(&TelemetryConfig { json: true });
    }
}
