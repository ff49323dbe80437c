//! Durable, replayable session event log.
//!
//! Architecture:
//! ```text
//! app action ──► SessionRecorder::record ──► EventBuffer
//!                                               │ count / bytes / age
//!                                               ▼
//!                                  SessionStore::append_batch (one WriteBatch)
//!                                               │
//!        ┌──────────────────────────────────────┼──────────────────────┐
//!        ▼                                      ▼                      ▼
//! CF "events"  <session:16><seq:4>    CF "events_by_time"      CF "sessions"
//!   LZ4(JSON event)                   <session:16><ts:8><seq:4>  session record
//! ```
//!
//! Sequence is the canonical replay order. Timestamps are advisory and
//! only drive "seek to time" queries.

pub mod buffer;
pub mod recorder;
pub mod session_store;

pub use buffer::EventBuffer;
pub use recorder::{RecorderConfig, SessionRecorder};
pub use session_store::{SessionStore, StoreConfig};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::backend::BackendError;
use crate::protocol::{now_millis, MessageType};

/// Kind of a logged action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SessionStart,
    SessionEnd,
    PeerJoin,
    PeerLeave,
    CursorMove,
    Click,
    Scroll,
    ChatMessage,
    NoteCreate,
    NoteUpdate,
    NoteDelete,
    DrawingStroke,
    DrawingClear,
    DomChange,
    ControlChange,
    LinkShare,
}

impl EventType {
    /// Event logged for a wire message, if that message is worth logging.
    pub fn for_message(kind: MessageType) -> Option<Self> {
        Some(match kind {
            MessageType::PeerConnected => EventType::PeerJoin,
            MessageType::PeerDisconnected => EventType::PeerLeave,
            MessageType::MouseMove => EventType::CursorMove,
            MessageType::MouseClick => EventType::Click,
            MessageType::ScrollUpdate => EventType::Scroll,
            MessageType::ChatMessage => EventType::ChatMessage,
            MessageType::NoteCreate => EventType::NoteCreate,
            MessageType::NoteUpdate => EventType::NoteUpdate,
            MessageType::NoteDelete => EventType::NoteDelete,
            MessageType::DrawingStroke => EventType::DrawingStroke,
            MessageType::DrawingClear => EventType::DrawingClear,
            MessageType::DomBatch => EventType::DomChange,
            MessageType::ControlRequest | MessageType::ControlGrant => EventType::ControlChange,
            MessageType::LinkShare => EventType::LinkShare,
            MessageType::PeerHello | MessageType::MouseLeave => return None,
        })
    }
}

/// An event not yet assigned a sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEvent {
    pub user_id: String,
    pub event_type: EventType,
    pub payload: Value,
    pub timestamp: i64,
}

impl NewEvent {
    /// Event stamped with the current wall clock.
    pub fn now(user_id: impl Into<String>, event_type: EventType, payload: Value) -> Self {
        Self::at(user_id, event_type, payload, now_millis())
    }

    pub fn at(user_id: impl Into<String>, event_type: EventType, payload: Value, timestamp: i64) -> Self {
        Self {
            user_id: user_id.into(),
            event_type,
            payload,
            timestamp,
        }
    }

    /// Rough in-memory footprint, used by the buffer's byte threshold.
    pub fn approx_size(&self) -> usize {
        self.user_id.len() + self.payload.to_string().len() + 32
    }
}

/// A persisted event. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
    pub id: String,
    pub user_id: String,
    pub event_type: EventType,
    pub payload: Value,
    pub timestamp: i64,
    pub sequence: u32,
}

/// One recording session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: Uuid,
    pub layer_id: String,
    /// Milliseconds since epoch
    pub created_at: i64,
}

/// Aggregates computed over a session's stored rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub session_id: Uuid,
    pub event_count: u64,
    pub first_timestamp: Option<i64>,
    pub last_timestamp: Option<i64>,
    pub duration_ms: i64,
    pub last_sequence: Option<u32>,
}

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Session not found: {0}")]
    SessionNotFound(Uuid),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Sequence space exhausted for session {0}")]
    SequenceExhausted(Uuid),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}
