//! In-memory transport backed by a shared broker.
//!
//! A [`MemoryNetwork`] plays the role of one layer's signaling service.
//! Each [`MemoryTransport`] registers with it and receives dialed channels
//! on its own accept queue. The network can be told to refuse
//! registrations or to drop an existing one, which is how tests exercise
//! the link manager's reconnect supervisor.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};

use super::{Channel, Registration, Transport, TransportError};

const ACCEPT_QUEUE: usize = 64;

struct Registered {
    accept_tx: mpsc::Sender<Channel>,
    closed_tx: oneshot::Sender<()>,
}

struct NetworkState {
    reachable: bool,
    peers: HashMap<String, Registered>,
}

/// Shared broker: routes channels between `MemoryTransport` instances.
#[derive(Clone)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
    channel_capacity: usize,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    /// Network whose channels buffer at most `channel_capacity` messages.
    pub fn with_capacity(channel_capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(NetworkState {
                reachable: true,
                peers: HashMap::new(),
            })),
            channel_capacity: channel_capacity.max(1),
        }
    }

    /// Toggle whether new registrations succeed.
    pub async fn set_reachable(&self, reachable: bool) {
        self.state.lock().await.reachable = reachable;
    }

    /// Drop a peer's signaling registration, as if its signaling socket died.
    /// Already-open channels stay up.
    pub async fn drop_registration(&self, peer_id: &str) -> bool {
        let removed = self.state.lock().await.peers.remove(peer_id);
        match removed {
            Some(reg) => {
                let _ = reg.closed_tx.send(());
                true
            }
            None => false,
        }
    }

    /// Ids of every registered peer.
    pub async fn registered(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.lock().await.peers.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("channel_capacity", &self.channel_capacity)
            .finish()
    }
}

/// In-memory `Transport` implementation.
pub struct MemoryTransport {
    network: MemoryNetwork,
    accept_tx: mpsc::Sender<Channel>,
    accept_rx: Mutex<mpsc::Receiver<Channel>>,
    peer_id: Mutex<Option<String>>,
}

impl MemoryTransport {
    pub fn new(network: &MemoryNetwork) -> Self {
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_QUEUE);
        Self {
            network: network.clone(),
            accept_tx,
            accept_rx: Mutex::new(accept_rx),
            peer_id: Mutex::new(None),
        }
    }

    /// Id obtained from the last successful registration.
    pub async fn peer_id(&self) -> Option<String> {
        self.peer_id.lock().await.clone()
    }
}

impl Transport for MemoryTransport {
    async fn register(&self, preferred_id: Option<String>) -> Result<Registration, TransportError> {
        let mut state = self.network.state.lock().await;
        if !state.reachable {
            return Err(TransportError::Unreachable("memory network offline".into()));
        }

        let peer_id = match preferred_id {
            Some(id) if !state.peers.contains_key(&id) => id,
            _ => format!("peer-{}", uuid::Uuid::new_v4()),
        };
        let peers: Vec<String> = state.peers.keys().cloned().collect();

        let (closed_tx, closed) = oneshot::channel();
        state.peers.insert(
            peer_id.clone(),
            Registered {
                accept_tx: self.accept_tx.clone(),
                closed_tx,
            },
        );
        drop(state);

        *self.peer_id.lock().await = Some(peer_id.clone());
        log::debug!("memory transport registered {peer_id} ({} peers)", peers.len());

        Ok(Registration {
            peer_id,
            peers,
            closed,
        })
    }

    async fn dial(&self, peer_id: &str) -> Result<Channel, TransportError> {
        let local_id = self
            .peer_id
            .lock()
            .await
            .clone()
            .ok_or(TransportError::NotRegistered)?;

        let accept_tx = {
            let state = self.network.state.lock().await;
            if !state.peers.contains_key(&local_id) {
                return Err(TransportError::NotRegistered);
            }
            state
                .peers
                .get(peer_id)
                .map(|reg| reg.accept_tx.clone())
                .ok_or_else(|| TransportError::UnknownPeer(peer_id.to_string()))?
        };

        let (local, remote) = Channel::pair(&local_id, peer_id, self.network.channel_capacity);
        accept_tx
            .send(remote)
            .await
            .map_err(|_| TransportError::Closed)?;
        Ok(local)
    }

    async fn accept(&self) -> Option<Channel> {
        self.accept_rx.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_lists_existing_peers() {
        let net = MemoryNetwork::new();
        let a = MemoryTransport::new(&net);
        let b = MemoryTransport::new(&net);

        let ra = a.register(Some("a".into())).await.unwrap();
        assert_eq!(ra.peer_id, "a");
        assert!(ra.peers.is_empty());

        let rb = b.register(Some("b".into())).await.unwrap();
        assert_eq!(rb.peers, vec!["a".to_string()]);
        assert_eq!(net.registered().await, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_preferred_id_taken_gets_fresh_id() {
        let net = MemoryNetwork::new();
        let a = MemoryTransport::new(&net);
        let b = MemoryTransport::new(&net);

        a.register(Some("same".into())).await.unwrap();
        let rb = b.register(Some("same".into())).await.unwrap();
        assert_ne!(rb.peer_id, "same");
        assert!(rb.peer_id.starts_with("peer-"));
    }

    #[tokio::test]
    async fn test_unreachable_network_rejects_register() {
        let net = MemoryNetwork::new();
        net.set_reachable(false).await;
        let a = MemoryTransport::new(&net);
        let err = a.register(None).await.unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_dial_and_accept() {
        let net = MemoryNetwork::new();
        let a = MemoryTransport::new(&net);
        let b = MemoryTransport::new(&net);
        a.register(Some("a".into())).await.unwrap();
        b.register(Some("b".into())).await.unwrap();

        let mut outbound = a.dial("b").await.unwrap();
        let mut inbound = b.accept().await.unwrap();
        assert_eq!(outbound.peer_id, "b");
        assert_eq!(inbound.peer_id, "a");

        outbound.sender.send(b"ping".to_vec()).await.unwrap();
        assert_eq!(inbound.receiver.recv().await.unwrap(), b"ping");
        inbound.sender.send(b"pong".to_vec()).await.unwrap();
        assert_eq!(outbound.receiver.recv().await.unwrap(), b"pong");
    }

    #[tokio::test]
    async fn test_dial_unknown_peer() {
        let net = MemoryNetwork::new();
        let a = MemoryTransport::new(&net);
        a.register(Some("a".into())).await.unwrap();
        let err = a.dial("ghost").await.unwrap_err();
        assert_eq!(err, TransportError::UnknownPeer("ghost".into()));
    }

    #[tokio::test]
    async fn test_dial_before_register() {
        let net = MemoryNetwork::new();
        let a = MemoryTransport::new(&net);
        assert_eq!(a.dial("b").await.unwrap_err(), TransportError::NotRegistered);
    }

    #[tokio::test]
    async fn test_drop_registration_fires_closed() {
        let net = MemoryNetwork::new();
        let a = MemoryTransport::new(&net);
        let reg = a.register(Some("a".into())).await.unwrap();

        assert!(net.drop_registration("a").await);
        assert!(reg.closed.await.is_ok());
        assert!(net.registered().await.is_empty());
        assert!(!net.drop_registration("a").await);
    }
}
