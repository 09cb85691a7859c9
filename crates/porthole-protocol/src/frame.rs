use std::collections::{BTreeMap, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while encoding frames
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One discrete tunnel message, tagged by `type` and correlated by `id`.
///
/// Frames that fail to parse against this schema are never acted upon and
/// never answered; [`Frame::decode`] returns `None` and the caller drops the
/// message without any observable effect.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    /// Connection handshake. The agent sends token/port/exposedPorts/timestamp
    /// immediately after the connection opens; the peer replies with only
    /// `mainSubdomain` set.
    #[serde(rename_all = "camelCase")]
    Auth {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exposed_ports: Option<BTreeMap<String, u16>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        main_subdomain: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Reserved in the schema; neither side of the agent path emits it.
    Open { id: String },

    /// Cancels the exchange `id`. Idempotent: closing an unknown exchange is
    /// a no-op.
    Close { id: String },

    /// Keepalive probe from the peer. The agent never initiates pings.
    Ping { id: String },

    /// Immediate reply to a `ping` with the same id.
    Pong { id: String },

    /// Announces one new inbound HTTP exchange.
    Request {
        id: String,
        method: String,
        path: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
    },

    /// Status line + headers for an exchange, sent by the agent as soon as
    /// the local call returns headers (before any body bytes).
    #[serde(rename_all = "camelCase")]
    Response {
        id: String,
        status_code: u16,
        headers: HashMap<String, String>,
    },

    /// One body chunk for an exchange, in either direction. `final: true`
    /// marks end-of-stream; the chunk itself may be empty.
    Data {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
        #[serde(default, rename = "final")]
        r#final: bool,
    },

    /// Declared in the schema but never produced by the agent; reserved for
    /// the peer side.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl Frame {
    /// Parse one wire message. Returns `None` for anything that is not a
    /// schema-valid frame (unknown `type`, missing required fields, wrong
    /// field shapes). Malformed input is dropped silently by design.
    pub fn decode(input: &str) -> Option<Frame> {
        serde_json::from_str(input).ok()
    }

    /// Serialize for sending.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// The exchange/keepalive correlation id, if this frame carries one.
    pub fn id(&self) -> Option<&str> {
        match self {
            Frame::Open { id }
            | Frame::Close { id }
            | Frame::Ping { id }
            | Frame::Pong { id }
            | Frame::Request { id, .. }
            | Frame::Response { id, .. }
            | Frame::Data { id, .. } => Some(id),
            Frame::Error { id, .. } => id.as_deref(),
            Frame::Auth { .. } => None,
        }
    }
}

/// Encode a body chunk for a `data` frame.
pub fn encode_chunk(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Decode a `data` frame payload. Invalid base64 gets the same silent-drop
/// treatment as an invalid frame.
pub fn decode_chunk(data: &str) -> Option<Vec<u8>> {
    base64::engine::general_purpose::STANDARD.decode(data).ok()
}

/// Milliseconds since the Unix epoch, for the auth frame timestamp.
pub fn unix_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
