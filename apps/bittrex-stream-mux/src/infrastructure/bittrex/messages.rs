//! SignalR Wire Frames
//!
//! Frame types for the SignalR 1.x persistent connection protocol as used by
//! the Bittrex `CoreHub`:
//!
//! - client → server: hub invocations `{"H","M","A","I"}`
//! - server → client: persistent frames carrying an init marker (`S`),
//!   hub messages (`M`), or an invocation result (`R`/`I`, error in `E`)
//!
//! The negotiate HTTP response is also modeled here.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// Negotiate
// =============================================================================

/// Response of the `/negotiate` HTTP call.
#[derive(Debug, Clone, Deserialize)]
pub struct NegotiateResponse {
    /// Token identifying the connection on subsequent calls.
    #[serde(rename = "ConnectionToken")]
    pub connection_token: String,
    /// Server-assigned connection id.
    #[serde(rename = "ConnectionId", default)]
    pub connection_id: Option<String>,
    /// Protocol version the server negotiated.
    #[serde(rename = "ProtocolVersion", default)]
    pub protocol_version: Option<String>,
}

// =============================================================================
// Client → Server
// =============================================================================

/// One hub method invocation.
#[derive(Debug, Clone, Serialize)]
pub struct HubInvocation {
    /// Hub name.
    #[serde(rename = "H")]
    pub hub: String,
    /// Method name.
    #[serde(rename = "M")]
    pub method: String,
    /// Positional arguments.
    #[serde(rename = "A")]
    pub args: Vec<Value>,
    /// Invocation id echoed back on the result frame.
    #[serde(rename = "I")]
    pub invocation_id: u64,
}

// =============================================================================
// Server → Client
// =============================================================================

/// A hub message pushed by the server.
#[derive(Debug, Clone, Deserialize)]
pub struct HubMessage {
    /// Hub name.
    #[serde(rename = "H", default)]
    pub hub: String,
    /// Method name, e.g. `updateExchangeState`.
    #[serde(rename = "M", default)]
    pub method: String,
    /// Positional arguments.
    #[serde(rename = "A", default)]
    pub args: Vec<Value>,
}

/// One frame of the persistent connection.
///
/// Frames are polymorphic: keep-alives are empty objects, the first frame
/// after connect carries `S: 1`, pushes carry `M`, and invocation results
/// carry `R`/`I` (the id arrives as a string or a number depending on the
/// server version).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PersistentFrame {
    /// Message cursor.
    #[serde(rename = "C", default)]
    pub cursor: Option<String>,
    /// Init marker, `1` on the first frame of a connection.
    #[serde(rename = "S", default)]
    pub init: Option<u8>,
    /// Pushed hub messages.
    #[serde(rename = "M", default)]
    pub messages: Vec<HubMessage>,
    /// Invocation result payload.
    #[serde(rename = "R", default)]
    pub result: Option<Value>,
    /// Invocation id of a result frame.
    #[serde(rename = "I", default)]
    pub invocation_id: Option<Value>,
    /// Invocation error text.
    #[serde(rename = "E", default)]
    pub error: Option<String>,
}

impl PersistentFrame {
    /// Whether this is the init frame of a fresh connection.
    #[must_use]
    pub fn is_init(&self) -> bool {
        self.init == Some(1)
    }

    /// Whether this frame answers an invocation.
    #[must_use]
    pub fn is_call_result(&self) -> bool {
        self.invocation_id.is_some()
    }

    /// Invocation id, normalized across the string and numeric encodings.
    #[must_use]
    pub fn call_id(&self) -> Option<u64> {
        match self.invocation_id.as_ref()? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invocation_serializes_to_hub_shape() {
        let call = HubInvocation {
            hub: "corehub".to_string(),
            method: "SubscribeToExchangeDeltas".to_string(),
            args: vec![Value::String("BTC-ETH".to_string())],
            invocation_id: 3,
        };
        let json = serde_json::to_string(&call).unwrap();
        assert!(json.contains(r#""H":"corehub""#));
        assert!(json.contains(r#""M":"SubscribeToExchangeDeltas""#));
        assert!(json.contains(r#""A":["BTC-ETH"]"#));
        assert!(json.contains(r#""I":3"#));
    }

    #[test]
    fn init_frame_detected() {
        let frame: PersistentFrame = serde_json::from_str(r#"{"C":"d-1","S":1,"M":[]}"#).unwrap();
        assert!(frame.is_init());
        assert!(!frame.is_call_result());
    }

    #[test]
    fn keep_alive_is_neither_init_nor_result() {
        let frame: PersistentFrame = serde_json::from_str("{}").unwrap();
        assert!(!frame.is_init());
        assert!(!frame.is_call_result());
        assert!(frame.messages.is_empty());
    }

    #[test]
    fn call_result_with_string_id() {
        let frame: PersistentFrame = serde_json::from_str(r#"{"R":true,"I":"7"}"#).unwrap();
        assert!(frame.is_call_result());
        assert_eq!(frame.call_id(), Some(7));
        assert_eq!(frame.result, Some(Value::Bool(true)));
    }

    #[test]
    fn call_result_with_numeric_id() {
        let frame: PersistentFrame = serde_json::from_str(r#"{"R":true,"I":7}"#).unwrap();
        assert_eq!(frame.call_id(), Some(7));
    }

    #[test]
    fn call_error_carried_in_e() {
        let frame: PersistentFrame =
            serde_json::from_str(r#"{"I":"2","E":"Hub method not found"}"#).unwrap();
        assert_eq!(frame.call_id(), Some(2));
        assert_eq!(frame.error.as_deref(), Some("Hub method not found"));
    }

    #[test]
    fn push_frame_carries_hub_messages() {
        let json = r#"{
            "C": "d-5",
            "M": [{
                "H": "CoreHub",
                "M": "updateExchangeState",
                "A": [{"MarketName": "BTC-ETH", "Nonce": 2, "Buys": [], "Sells": [], "Fills": []}]
            }]
        }"#;
        let frame: PersistentFrame = serde_json::from_str(json).unwrap();
        assert_eq!(frame.messages.len(), 1);
        assert_eq!(frame.messages[0].method, "updateExchangeState");

        let delta: crate::domain::market::BookDelta =
            serde_json::from_value(frame.messages[0].args[0].clone()).unwrap();
        assert_eq!(delta.market_name, "BTC-ETH");
    }

    #[test]
    fn negotiate_response_deserializes() {
        let json = r#"{
            "ConnectionToken": "abc+def==",
            "ConnectionId": "11b8-4f",
            "ProtocolVersion": "1.5"
        }"#;
        let negotiate: NegotiateResponse = serde_json::from_str(json).unwrap();
        assert_eq!(negotiate.connection_token, "abc+def==");
        assert_eq!(negotiate.protocol_version.as_deref(), Some("1.5"));
    }
}
