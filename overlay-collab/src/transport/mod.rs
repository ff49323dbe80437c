//! Transport abstraction for peer links.
//!
//! The link manager only needs three things from the network: a signaling
//! registration that hands out a peer id, the ability to dial a listed peer,
//! and a queue of incoming channels. [`MemoryTransport`] serves tests and
//! in-process embedding; [`WsTransport`] talks to the relay server.

pub mod memory;
pub mod ws;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use ws::WsTransport;

use std::future::Future;
use tokio::sync::{mpsc, oneshot};

/// Error type for transport operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Signaling unreachable: {0}")]
    Unreachable(String),
    #[error("Not registered with signaling")]
    NotRegistered,
    #[error("Unknown peer: {0}")]
    UnknownPeer(String),
    #[error("Channel closed")]
    Closed,
}

/// Result of a successful signaling registration.
#[derive(Debug)]
pub struct Registration {
    /// Id assigned to the local peer.
    pub peer_id: String,
    /// Peers already present in the layer at registration time.
    pub peers: Vec<String>,
    /// Resolves when the signaling registration is lost.
    pub closed: oneshot::Receiver<()>,
}

/// A reliable, ordered, bounded byte pipe to one remote peer.
///
/// Dropping the `sender` closes the channel for the remote side;
/// `receiver` yields `None` once the remote side is gone.
#[derive(Debug)]
pub struct Channel {
    pub peer_id: String,
    pub sender: mpsc::Sender<Vec<u8>>,
    pub receiver: mpsc::Receiver<Vec<u8>>,
}

impl Channel {
    /// Create two connected channel ends. `a` is held by peer `a_id` and
    /// talks to `b_id`.
    pub fn pair(a_id: &str, b_id: &str, capacity: usize) -> (Channel, Channel) {
        let (a_tx, b_rx) = mpsc::channel(capacity);
        let (b_tx, a_rx) = mpsc::channel(capacity);
        (
            Channel {
                peer_id: b_id.to_string(),
                sender: a_tx,
                receiver: a_rx,
            },
            Channel {
                peer_id: a_id.to_string(),
                sender: b_tx,
                receiver: b_rx,
            },
        )
    }
}

/// Signaling + channel establishment.
pub trait Transport: Send + Sync + 'static {
    /// Register with signaling, preferring `preferred_id` when it is free.
    fn register(
        &self,
        preferred_id: Option<String>,
    ) -> impl Future<Output = Result<Registration, TransportError>> + Send;

    /// Open a channel to a registered peer.
    fn dial(&self, peer_id: &str) -> impl Future<Output = Result<Channel, TransportError>> + Send;

    /// Wait for the next incoming channel. `None` on shutdown.
    fn accept(&self) -> impl Future<Output = Option<Channel>> + Send;
}
