//! Bittrex Adapters
//!
//! Default implementations of the transport and bypass ports:
//!
//! - `signalr`: SignalR 1.x hub client over reqwest (negotiate) and
//!   tokio-tungstenite (persistent connection).
//! - `bypass`: gateway bypass fetcher yielding the user-agent + cookie pair.
//! - `messages`: SignalR wire frames.

pub mod bypass;
pub mod messages;
pub mod signalr;

pub use bypass::GatewayBypassFetcher;
pub use signalr::{SignalRConfig, SignalRConnector};
