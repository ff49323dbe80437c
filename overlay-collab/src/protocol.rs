//! Wire formats.
//!
//! Two layers:
//!
//! ```text
//! ┌─────────────────────────── WebSocket binary message ───────────────────────┐
//! │ RelayFrame (bincode)                                                        │
//! │   Data { peer_id, key, bytes ─┐ }                                           │
//! └───────────────────────────────┼─────────────────────────────────────────────┘
//!                                 ▼
//!            Envelope (JSON) { type, userId, layerId, timestamp, sequence, payload }
//! ```
//!
//! Envelopes are what peers exchange over a channel, whatever the transport.
//! Relay frames only exist between a `WsTransport` and the relay server.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Message types known to the collaboration layer.
///
/// The last two variants are synthesized locally by the link manager and
/// are never accepted from the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    PeerHello,
    MouseMove,
    MouseClick,
    MouseLeave,
    ScrollUpdate,
    ChatMessage,
    NoteCreate,
    NoteUpdate,
    NoteDelete,
    DrawingStroke,
    DrawingClear,
    DomBatch,
    ControlRequest,
    ControlGrant,
    LinkShare,
    PeerConnected,
    PeerDisconnected,
}

impl MessageType {
    pub const ALL: [MessageType; 17] = [
        MessageType::PeerHello,
        MessageType::MouseMove,
        MessageType::MouseClick,
        MessageType::MouseLeave,
        MessageType::ScrollUpdate,
        MessageType::ChatMessage,
        MessageType::NoteCreate,
        MessageType::NoteUpdate,
        MessageType::NoteDelete,
        MessageType::DrawingStroke,
        MessageType::DrawingClear,
        MessageType::DomBatch,
        MessageType::ControlRequest,
        MessageType::ControlGrant,
        MessageType::LinkShare,
        MessageType::PeerConnected,
        MessageType::PeerDisconnected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::PeerHello => "peer:hello",
            MessageType::MouseMove => "mouse:move",
            MessageType::MouseClick => "mouse:click",
            MessageType::MouseLeave => "mouse:leave",
            MessageType::ScrollUpdate => "scroll:update",
            MessageType::ChatMessage => "chat:message",
            MessageType::NoteCreate => "note:create",
            MessageType::NoteUpdate => "note:update",
            MessageType::NoteDelete => "note:delete",
            MessageType::DrawingStroke => "drawing:stroke",
            MessageType::DrawingClear => "drawing:clear",
            MessageType::DomBatch => "dom:batch",
            MessageType::ControlRequest => "control:request",
            MessageType::ControlGrant => "control:grant",
            MessageType::LinkShare => "link:share",
            MessageType::PeerConnected => "peer:connected",
            MessageType::PeerDisconnected => "peer:disconnected",
        }
    }

    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == name)
    }

    /// Synthesized by the local link manager only.
    pub fn is_local(&self) -> bool {
        matches!(self, MessageType::PeerConnected | MessageType::PeerDisconnected)
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The addressed, sequenced wire unit exchanged between peers.
///
/// `sequence` is monotonic per sending link manager only; there is no
/// global order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub user_id: String,
    pub layer_id: String,
    pub timestamp: i64,
    pub sequence: u32,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    /// Create an envelope stamped with the current wall clock.
    pub fn new(
        msg_type: impl Into<String>,
        user_id: impl Into<String>,
        layer_id: impl Into<String>,
        sequence: u32,
        payload: Value,
    ) -> Self {
        Self {
            msg_type: msg_type.into(),
            user_id: user_id.into(),
            layer_id: layer_id.into(),
            timestamp: now_millis(),
            sequence,
            payload,
        }
    }

    /// Known type, if any.
    pub fn kind(&self) -> Option<MessageType> {
        MessageType::from_wire(&self.msg_type)
    }

    pub fn is(&self, kind: MessageType) -> bool {
        self.msg_type == kind.as_str()
    }

    /// Deserialize the payload into a typed struct.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// Serialize to the JSON wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse from the JSON wire format without any payload validation.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Identity of a peer, exchanged in `peer:hello` during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerHello {
    pub user_id: String,
    #[serde(default)]
    pub role: PeerRole,
    #[serde(default)]
    pub has_control: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl PeerHello {
    pub fn new(user_id: impl Into<String>, role: PeerRole) -> Self {
        Self {
            user_id: user_id.into(),
            role,
            has_control: false,
            display_name: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    Owner,
    Editor,
    #[default]
    Viewer,
}

impl PeerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerRole::Owner => "owner",
            PeerRole::Editor => "editor",
            PeerRole::Viewer => "viewer",
        }
    }
}

/// Identifies one virtual channel on the relay: the peer that opened it
/// plus that peer's local counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelKey {
    pub opener: String,
    pub id: u64,
}

/// Frames exchanged between a `WsTransport` and the relay server.
///
/// `peer_id` is the destination when sent by a client and the origin when
/// delivered by the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RelayFrame {
    Register {
        layer_id: String,
        preferred_id: Option<String>,
    },
    Registered {
        peer_id: String,
        peers: Vec<String>,
    },
    Rejected {
        reason: String,
    },
    PeerJoined {
        peer_id: String,
    },
    PeerLeft {
        peer_id: String,
    },
    Open {
        peer_id: String,
        key: ChannelKey,
    },
    Data {
        peer_id: String,
        key: ChannelKey,
        bytes: Vec<u8>,
    },
    Close {
        peer_id: String,
        key: ChannelKey,
    },
    Ping,
    Pong,
}

impl RelayFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(frame)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection timeout")]
    Timeout,
}
