//! Bittrex Stream Mux Binary
//!
//! Starts the market data mux and subscribes the configured markets.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin bittrex-stream-mux
//! ```
//!
//! # Environment Variables
//!
//! ## Optional
//! - `BITTREX_MARKETS`: Comma-separated market keys (default: BTC-ETH)
//! - `BITTREX_GATEWAY_URL`: Bypass gateway URL (default: <https://bittrex.com/>)
//! - `BITTREX_SIGNALR_URL`: SignalR endpoint (default: <https://socket.bittrex.com/signalr>)
//! - `BITTREX_SHARD_CAPACITY`: Pairs per connection (default: 10)
//! - `BITTREX_RECONNECT_DELAY_INITIAL_MS` / `BITTREX_RECONNECT_DELAY_MAX_SECS`
//! - `LOG_FORMAT`: "json" for machine-readable logs
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;

use bittrex_stream_mux::application::services::orchestrator::FeedOrchestrator;
use bittrex_stream_mux::infrastructure::bittrex::{GatewayBypassFetcher, SignalRConnector};
use bittrex_stream_mux::infrastructure::telemetry;
use bittrex_stream_mux::{
    BookDelta, BookSnapshot, ConsumerFactory, ConsumerHandle, FeedConsumer, MarketKey, MuxConfig,
};
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    #[allow(clippy::expect_used)]
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    load_dotenv();
    telemetry::init();

    tracing::info!("Starting Bittrex Stream Mux");

    let config = MuxConfig::from_env()?;
    log_config(&config);

    let fetcher = Arc::new(GatewayBypassFetcher::new(
        config.endpoints.gateway_url.clone(),
    )?);
    let connector = Arc::new(SignalRConnector::new(config.signalr())?);
    let factory = Arc::new(LoggingConsumerFactory);

    let orchestrator = FeedOrchestrator::new(connector, fetcher, factory, config.orchestrator());

    for key in market_keys()? {
        match orchestrator.subscribe(key.clone()).await {
            Ok(_) => tracing::info!(market = %key, "Subscribed"),
            Err(e) => tracing::error!(market = %key, error = %e, "Subscription failed"),
        }
    }

    tracing::info!(
        subscriptions = orchestrator.subscription_count().await,
        shards = orchestrator.shard_count().await,
        "Stream mux ready"
    );

    await_shutdown().await;

    orchestrator.reset().await;
    tracing::info!("Stream mux stopped");
    Ok(())
}

/// Parse the configured market list.
fn market_keys() -> Result<Vec<MarketKey>, Box<dyn std::error::Error>> {
    let raw = std::env::var("BITTREX_MARKETS").unwrap_or_else(|_| "BTC-ETH".to_string());
    let mut keys = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if !part.is_empty() {
            keys.push(part.parse::<MarketKey>()?);
        }
    }
    Ok(keys)
}

/// Consumer that logs feed activity instead of maintaining a book.
struct LoggingConsumer {
    key: MarketKey,
}

impl FeedConsumer for LoggingConsumer {
    fn key(&self) -> &MarketKey {
        &self.key
    }

    fn apply_snapshot(&self, snapshot: BookSnapshot) {
        tracing::info!(
            market = %self.key,
            nonce = snapshot.nonce,
            buys = snapshot.buys.len(),
            sells = snapshot.sells.len(),
            "Snapshot received"
        );
    }

    fn apply_delta(&self, delta: BookDelta) {
        tracing::debug!(
            market = %self.key,
            nonce = delta.nonce,
            buys = delta.buys.len(),
            sells = delta.sells.len(),
            fills = delta.fills.len(),
            "Delta received"
        );
    }
}

struct LoggingConsumerFactory;

impl ConsumerFactory for LoggingConsumerFactory {
    fn create(&self, key: &MarketKey) -> ConsumerHandle {
        Arc::new(LoggingConsumer { key: key.clone() })
    }
}

/// Load .env, falling back to ancestor directories (workspace root).
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &MuxConfig) {
    tracing::info!(
        gateway_url = %config.endpoints.gateway_url,
        signalr_url = %config.endpoints.signalr_url,
        shard_capacity = config.shard.capacity,
        "Configuration loaded"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
