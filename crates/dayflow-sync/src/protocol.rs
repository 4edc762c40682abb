//! # Relay Protocol Messages
//!
//! Frames exchanged between [`WsRemote`](crate::remote::WsRemote) and the
//! relay server.
//!
//! ## Protocol Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Relay Protocol Messages                            │
//! │                                                                         │
//! │  WRITES & READS                                                        │
//! │  ──────────────                                                        │
//! │  CLIENT ───► Write { request_id, path, value }                         │
//! │  RELAY  ◄─── Ack { request_id }                                        │
//! │  CLIENT ───► Read { request_id, path }                                 │
//! │  RELAY  ◄─── ReadResult { request_id, value }                          │
//! │                                                                         │
//! │  LISTENERS                                                             │
//! │  ─────────                                                             │
//! │  CLIENT ───► Subscribe { subscription_id, path, start_at }             │
//! │  RELAY  ◄─── Event { subscription_id, value }   (initial + on change)  │
//! │  CLIENT ───► Unsubscribe { subscription_id }                           │
//! │                                                                         │
//! │  ERRORS                                                                │
//! │  ──────                                                                │
//! │  RELAY  ◄─── Error { request_id?, subscription_id?, message }          │
//! │              subscription_id set: the listener was cancelled            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wire Format
//! Internally tagged JSON:
//! ```json
//! { "type": "write", "request_id": 7, "path": "users/u/gameState", "value": {...} }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current protocol version, reported by the relay health endpoint.
pub const PROTOCOL_VERSION: u32 = 1;

/// All relay protocol frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    // =========================================================================
    // Client Requests
    // =========================================================================
    /// Sets (`Some`) or removes (`None`) a node.
    Write {
        request_id: u64,
        path: String,
        value: Option<Value>,
    },

    /// Reads a node.
    Read { request_id: u64, path: String },

    /// Starts a listener.
    Subscribe {
        subscription_id: u64,
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start_at: Option<String>,
    },

    /// Stops a listener.
    Unsubscribe { subscription_id: u64 },

    // =========================================================================
    // Relay Responses
    // =========================================================================
    /// A write was applied.
    Ack { request_id: u64 },

    /// Answer to a read.
    ReadResult {
        request_id: u64,
        value: Option<Value>,
    },

    /// Listener snapshot.
    Event {
        subscription_id: u64,
        value: Option<Value>,
    },

    /// A request failed or a listener was cancelled.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subscription_id: Option<u64>,
        message: String,
    },
}

impl RelayMessage {
    /// Returns the message type name for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            RelayMessage::Write { .. } => "write",
            RelayMessage::Read { .. } => "read",
            RelayMessage::Subscribe { .. } => "subscribe",
            RelayMessage::Unsubscribe { .. } => "unsubscribe",
            RelayMessage::Ack { .. } => "ack",
            RelayMessage::ReadResult { .. } => "read_result",
            RelayMessage::Event { .. } => "event",
            RelayMessage::Error { .. } => "error",
        }
    }

    /// Error frame answering a request.
    pub fn request_error(request_id: u64, message: impl Into<String>) -> Self {
        RelayMessage::Error {
            request_id: Some(request_id),
            subscription_id: None,
            message: message.into(),
        }
    }

    /// Error frame cancelling a listener.
    pub fn subscription_error(subscription_id: u64, message: impl Into<String>) -> Self {
        RelayMessage::Error {
            request_id: None,
            subscription_id: Some(subscription_id),
            message: message.into(),
        }
    }

    /// Serializes to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserializes from JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
