//! Gateway opcodes, event types, and wire-format messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Opcodes
// ---------------------------------------------------------------------------

pub const OP_DISPATCH: u8 = 0;
pub const OP_HEARTBEAT: u8 = 1;
pub const OP_IDENTIFY: u8 = 2;
pub const OP_HEARTBEAT_ACK: u8 = 6;
pub const OP_RECONNECT: u8 = 7;

// ---------------------------------------------------------------------------
// Server → Client message
// ---------------------------------------------------------------------------

/// A message sent from the server to the client over WebSocket.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayMessage {
    pub op: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    pub d: Value,
}

impl GatewayMessage {
    /// Build a DISPATCH message (op=0).
    pub fn dispatch(event_name: &str, seq: u64, data: Value) -> Self {
        Self {
            op: OP_DISPATCH,
            t: Some(event_name.to_string()),
            s: Some(seq),
            d: data,
        }
    }

    /// Build a RECONNECT message (op=7) telling the client to re-IDENTIFY.
    pub fn reconnect(reason: &str) -> Self {
        Self {
            op: OP_RECONNECT,
            t: None,
            s: None,
            d: serde_json::json!({ "reason": reason }),
        }
    }

    /// Build a HEARTBEAT_ACK message (op=6).
    pub fn heartbeat_ack(seq: u64) -> Self {
        Self {
            op: OP_HEARTBEAT_ACK,
            t: None,
            s: None,
            d: serde_json::json!({ "ack": seq }),
        }
    }
}

// ---------------------------------------------------------------------------
// Client → Server message
// ---------------------------------------------------------------------------

/// A message received from the client over WebSocket.
#[derive(Debug, Deserialize)]
pub struct ClientMessage {
    pub op: u8,
    #[serde(default)]
    pub t: Option<String>,
    #[serde(default)]
    pub d: Value,
}

// ---------------------------------------------------------------------------
// An event queued for a specific connection
// ---------------------------------------------------------------------------

/// A dispatch event on its way to one connection's socket. The session loop
/// assigns the per-connection sequence number when it writes the frame.
#[derive(Debug, Clone)]
pub struct OutboundEvent {
    pub event_name: String,
    pub data: Value,
}

impl OutboundEvent {
    pub fn new(event_name: &str, data: Value) -> Self {
        Self {
            event_name: event_name.to_string(),
            data,
        }
    }
}

// ---------------------------------------------------------------------------
// Client payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct IdentifyPayload {
    pub user_id: String,
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatPayload {
    #[serde(default)]
    pub seq: u64,
}

#[derive(Debug, Deserialize)]
pub struct SendMessagePayload {
    pub receiver_id: String,
    pub thread_id: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct TypingPayload {
    pub thread_id: String,
    pub is_typing: bool,
}

#[derive(Debug, Deserialize)]
pub struct MarkReadPayload {
    pub message_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct EarnPointsPayload {
    pub action_type: String,
    #[serde(default)]
    pub multiplier: Option<f64>,
    #[serde(default)]
    pub metadata: Value,
}

// ---------------------------------------------------------------------------
// Dispatch event names
// ---------------------------------------------------------------------------

/// Event names dispatched to clients.
pub struct EventName;

impl EventName {
    pub const READY: &'static str = "READY";
    pub const MESSAGE_SENT: &'static str = "MESSAGE_SENT";
    pub const MESSAGE_RECEIVED: &'static str = "MESSAGE_RECEIVED";
    pub const MESSAGE_STATUS_CHANGED: &'static str = "MESSAGE_STATUS_CHANGED";
    pub const PRESENCE_CHANGED: &'static str = "PRESENCE_CHANGED";
    pub const LEADERBOARD_UPDATED: &'static str = "LEADERBOARD_UPDATED";
    pub const POINTS_EARNED: &'static str = "POINTS_EARNED";
    pub const ERROR: &'static str = "ERROR";
}

/// Event names accepted from clients (op=0 dispatches).
pub struct ClientEvent;

impl ClientEvent {
    pub const SEND_MESSAGE: &'static str = "SEND_MESSAGE";
    pub const TYPING: &'static str = "TYPING";
    pub const MARK_READ: &'static str = "MARK_READ";
    pub const EARN_POINTS: &'static str = "EARN_POINTS";
}
