//! # overlay-collab — Real-time collaboration core for page overlays
//!
//! Peers sharing a layer (cursors, notes, drawings over a web page) talk over
//! direct links. Every inbound message is validated before anything acts on
//! it, and semantic actions are logged to a replayable session store.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   signaling / frames   ┌──────────────┐
//! │ LinkManager  │ ◄────────────────────► │ RelayServer  │
//! │ (per client) │      WsTransport       │ (per layer)  │
//! └──────┬───────┘                        └──────────────┘
//!        │ validated envelopes
//!        ├──────────────► CursorTracker (interpolated remote cursors)
//!        ├──────────────► DomReplicator (dom:batch apply, loop-free)
//!        └──────────────► SessionRecorder ──► SessionStore (RocksDB)
//!
//! local input ──► PointerStream / ScrollStream (adaptive throttle) ──► broadcast
//! local DOM   ──► DomReplicator (capture + 16ms batches)             ──► broadcast
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON envelopes and bincode relay frames
//! - [`transport`] — In-memory and WebSocket relay transports
//! - [`relay`] — Signaling/relay server
//! - [`link`] — Peer link manager: mesh lifecycle, sequencing, dispatch
//! - [`throttle`] — Adaptive throttle, interpolator, cursor tracking
//! - [`replicator`] — DOM delta capture, batching and apply
//! - [`validation`] — Size, depth, schema, rate and reputation checks
//! - [`storage`] — Session event log
//! - [`identity`] — Durable local user/peer ids
//! - [`backend`] — Remote workspace service boundary
//! - [`config`] — Aggregate JSON configuration

pub mod backend;
pub mod config;
pub mod identity;
pub mod link;
pub mod protocol;
pub mod relay;
pub mod replicator;
pub mod storage;
pub mod throttle;
pub mod transport;
pub mod validation;

// Re-exports for convenience
pub use backend::{BackendError, MemoryBackend, WorkspaceBackend};
pub use config::{CollabConfig, ConfigError};
pub use identity::{DurableIdentity, IdentityError, JsonFileKeyValue, KeyValueStore, MemoryKeyValue};
pub use link::{
    ConnectionState, HandlerError, LinkConfig, LinkError, LinkManager, LinkStats, PeerInfo,
    PeerStatus,
};
pub use protocol::{Envelope, MessageType, PeerHello, PeerRole, ProtocolError, RelayFrame};
pub use relay::{RelayConfig, RelayServer, RelayStats};
pub use replicator::{
    ApplyOutcome, ApplyReport, ChangeKind, DomChange, DomDelta, DomReplicator, ReplicatorConfig,
};
pub use storage::{
    EventType, NewEvent, RecorderConfig, SessionEvent, SessionMetadata, SessionRecord,
    SessionRecorder, SessionStore, StoreConfig, StoreError,
};
pub use throttle::{
    AdaptiveThrottle, CursorTracker, Interpolator, InterpolatorConfig, PointerStream,
    ScrollStream, ThrottleConfig, Vec2,
};
pub use transport::{MemoryNetwork, MemoryTransport, Transport, TransportError, WsTransport};
pub use validation::{
    Origin, ReportLedger, ReportReason, ReputationPolicy, SchemaRegistry, ValidationConfig,
    ValidationError, Validator,
};
