//! Real-time wire protocol: JSON objects tagged by `type`

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{GatewayError, Result};

/// Message sent by a client
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    JoinRoom { room: String },
    LeaveRoom { room: String },
    Broadcast {
        room: String,
        #[serde(default)]
        data: Value,
    },
    Ping,
    /// Answer to a hub heartbeat
    Pong,
}

const CLIENT_MESSAGE_TYPES: &[&str] = &["join_room", "leave_room", "broadcast", "ping", "pong"];

/// Message sent by the hub
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome { connection_id: String },
    RoomJoined { room: String, members: usize },
    RoomLeft { room: String },
    Broadcast { room: String, from: String, data: Value },
    Pong { timestamp: i64 },
    /// Heartbeat; clients answer with `pong`
    Ping { timestamp: i64 },
    Error { code: String, message: String },
}

impl ServerMessage {
    pub fn error(err: &GatewayError) -> Self {
        ServerMessage::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// A parsed inbound line
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message(ClientMessage),
    /// Well-formed, but of a type the hub does not handle
    Unknown(String),
}

/// Parse one inbound line.
///
/// Unknown `type` values are not errors; anything that is not a JSON object
/// with a string `type`, or a known type with bad fields, is.
pub fn parse_client_message(raw: &str) -> Result<Inbound> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| GatewayError::Protocol(format!("malformed message: {}", e)))?;

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::Protocol("message has no string `type` field".to_string()))?;

    if !CLIENT_MESSAGE_TYPES.contains(&kind) {
        return Ok(Inbound::Unknown(kind.to_string()));
    }

    serde_json::from_value(value)
        .map(Inbound::Message)
        .map_err(|e| GatewayError::Protocol(format!("invalid message: {}", e)))
}
