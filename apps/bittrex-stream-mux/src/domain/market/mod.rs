//! Market Data Types
//!
//! Domain types for Bittrex market data: currency-pair keys, full order book
//! snapshots, and incremental book deltas.
//!
//! Field names mirror the exchange payloads (`MarketName`, `Nonce`, `Buys`,
//! `Sells`, `Fills`, `Rate`, `Quantity`) so the wire adapter can deserialize
//! directly into these types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Market Key
// =============================================================================

/// Identifier of one logical subscription: a traded currency pair such as
/// `BTC-ETH` (base-market notation used by the exchange).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MarketKey(String);

impl MarketKey {
    /// Create a market key, validating the `BASE-QUOTE` shape.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidMarketKey`] if the string is empty or is not two
    /// non-empty currency codes separated by a single dash.
    pub fn new(raw: impl Into<String>) -> Result<Self, InvalidMarketKey> {
        let raw = raw.into();
        let mut parts = raw.split('-');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(base), Some(quote), None) if !base.is_empty() && !quote.is_empty() => {
                Ok(Self(raw))
            }
            _ => Err(InvalidMarketKey(raw)),
        }
    }

    /// The raw pair string, e.g. `BTC-ETH`.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The base currency code (before the dash).
    #[must_use]
    pub fn base(&self) -> &str {
        self.0.split('-').next().unwrap_or(&self.0)
    }

    /// The quote currency code (after the dash).
    #[must_use]
    pub fn quote(&self) -> &str {
        self.0.split('-').nth(1).unwrap_or(&self.0)
    }
}

impl fmt::Display for MarketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for MarketKey {
    type Err = InvalidMarketKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Error returned for a malformed currency-pair string.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid market key: {0:?} (expected BASE-QUOTE)")]
pub struct InvalidMarketKey(pub String);

// =============================================================================
// Order Book Entries
// =============================================================================

/// One resting order book level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookEntry {
    /// Total quantity resting at this price level.
    #[serde(rename = "Quantity")]
    pub quantity: Decimal,
    /// Price of the level.
    #[serde(rename = "Rate")]
    pub rate: Decimal,
}

/// Kind of change carried by a delta book level.
///
/// Wire encoding is a bare integer (`Type` field).
pub mod delta_kind {
    /// A new price level was added.
    pub const ADD: u8 = 0;
    /// The price level was removed.
    pub const REMOVE: u8 = 1;
    /// The quantity at the price level changed.
    pub const UPDATE: u8 = 2;
}

/// One changed order book level inside a delta message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaEntry {
    /// Change kind, one of the [`delta_kind`] constants.
    #[serde(rename = "Type")]
    pub kind: u8,
    /// Quantity after the change (zero for removals).
    #[serde(rename = "Quantity")]
    pub quantity: Decimal,
    /// Price of the changed level.
    #[serde(rename = "Rate")]
    pub rate: Decimal,
}

impl DeltaEntry {
    /// Whether this entry removes its price level.
    #[must_use]
    pub fn is_removal(&self) -> bool {
        self.kind == delta_kind::REMOVE
    }
}

/// An executed trade reported alongside book changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fill {
    /// Taker side, `BUY` or `SELL`.
    #[serde(rename = "OrderType")]
    pub order_type: String,
    /// Executed price.
    #[serde(rename = "Rate")]
    pub rate: Decimal,
    /// Executed quantity.
    #[serde(rename = "Quantity")]
    pub quantity: Decimal,
    /// Exchange timestamp of the fill.
    #[serde(rename = "TimeStamp")]
    pub timestamp: DateTime<Utc>,
}

// =============================================================================
// Snapshot and Delta
// =============================================================================

/// Full order book state returned by the snapshot query
/// (`QueryExchangeState`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookSnapshot {
    /// Pair the snapshot belongs to. The exchange omits this on snapshot
    /// responses, so it may be absent.
    #[serde(rename = "MarketName", default)]
    pub market_name: Option<String>,
    /// Sequence number the snapshot is valid at.
    #[serde(rename = "Nonce", default)]
    pub nonce: u64,
    /// Bid side of the book.
    #[serde(rename = "Buys", default)]
    pub buys: Vec<BookEntry>,
    /// Ask side of the book.
    #[serde(rename = "Sells", default)]
    pub sells: Vec<BookEntry>,
    /// Recent fills.
    #[serde(rename = "Fills", default)]
    pub fills: Vec<Fill>,
}

/// Incremental order book update pushed by the hub
/// (`updateExchangeState`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookDelta {
    /// Pair the delta belongs to.
    #[serde(rename = "MarketName")]
    pub market_name: String,
    /// Sequence number of the delta.
    #[serde(rename = "Nonce", default)]
    pub nonce: u64,
    /// Changed bid levels.
    #[serde(rename = "Buys", default)]
    pub buys: Vec<DeltaEntry>,
    /// Changed ask levels.
    #[serde(rename = "Sells", default)]
    pub sells: Vec<DeltaEntry>,
    /// Fills since the previous delta.
    #[serde(rename = "Fills", default)]
    pub fills: Vec<Fill>,
}

impl BookDelta {
    /// Market key the delta belongs to.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidMarketKey`] if the exchange sent a malformed pair.
    pub fn key(&self) -> Result<MarketKey, InvalidMarketKey> {
        MarketKey::new(self.market_name.clone())
    }
}

// =============================================================================
// Tests
// =============================================================================
