//! WebSocket client of the relay server.
//!
//! One socket carries every virtual channel of the local peer:
//!
//! ```text
//! Channel.sender ──► pump task ──Data{peer, key}──► writer task ──► socket
//! socket ──► reader task ──► routes[key] ──► Channel.receiver
//! ```
//!
//! Losing the socket ends the registration (the `closed` receiver fires)
//! and closes every virtual channel riding on it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message;

use super::{Channel, Registration, Transport, TransportError};
use crate::protocol::{ChannelKey, RelayFrame};

const ACCEPT_QUEUE: usize = 64;
const OUTGOING_QUEUE: usize = 1024;

struct Route {
    remote: String,
    inbound: mpsc::Sender<Vec<u8>>,
}

/// State of one live relay session.
struct Session {
    peer_id: String,
    out_tx: mpsc::Sender<Vec<u8>>,
    routes: Arc<Mutex<HashMap<ChannelKey, Route>>>,
    known_peers: Arc<Mutex<HashSet<String>>>,
}

/// Relay-backed `Transport`.
pub struct WsTransport {
    url: String,
    layer_id: String,
    channel_capacity: usize,
    register_timeout: Duration,
    next_channel: AtomicU64,
    accept_tx: mpsc::Sender<Channel>,
    accept_rx: Mutex<mpsc::Receiver<Channel>>,
    session: Arc<Mutex<Option<Session>>>,
}

impl WsTransport {
    /// `url` is the relay endpoint, e.g. `ws://127.0.0.1:9090`.
    pub fn new(url: impl Into<String>, layer_id: impl Into<String>) -> Self {
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_QUEUE);
        Self {
            url: url.into(),
            layer_id: layer_id.into(),
            channel_capacity: 256,
            register_timeout: Duration::from_secs(10),
            next_channel: AtomicU64::new(1),
            accept_tx,
            accept_rx: Mutex::new(accept_rx),
            session: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn with_register_timeout(mut self, timeout: Duration) -> Self {
        self.register_timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn layer_id(&self) -> &str {
        &self.layer_id
    }

    /// Peers the relay currently reports in the layer.
    pub async fn known_peers(&self) -> Vec<String> {
        let known = match self.session.lock().await.as_ref() {
            Some(session) => session.known_peers.clone(),
            None => return Vec::new(),
        };
        let mut peers: Vec<String> = known.lock().await.iter().cloned().collect();
        peers.sort();
        peers
    }
}

/// Create the app-facing end of a virtual channel and the pump that moves
/// its outbound bytes onto the socket.
async fn open_virtual(
    routes: &Arc<Mutex<HashMap<ChannelKey, Route>>>,
    out_tx: &mpsc::Sender<Vec<u8>>,
    remote: &str,
    key: ChannelKey,
    capacity: usize,
) -> Channel {
    let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Vec<u8>>(capacity);

    routes.lock().await.insert(
        key.clone(),
        Route {
            remote: remote.to_string(),
            inbound: inbound_tx,
        },
    );

    let routes = routes.clone();
    let out_tx = out_tx.clone();
    let remote_id = remote.to_string();
    tokio::spawn(async move {
        while let Some(bytes) = outbound_rx.recv().await {
            let frame = RelayFrame::Data {
                peer_id: remote_id.clone(),
                key: key.clone(),
                bytes,
            };
            match frame.encode() {
                Ok(encoded) => {
                    if out_tx.send(encoded).await.is_err() {
                        break;
                    }
                }
                Err(e) => log::warn!("Dropping unencodable frame to {remote_id}: {e}"),
            }
        }
        routes.lock().await.remove(&key);
        let close = RelayFrame::Close {
            peer_id: remote_id,
            key,
        };
        if let Ok(encoded) = close.encode() {
            let _ = out_tx.send(encoded).await;
        }
    });

    Channel {
        peer_id: remote.to_string(),
        sender: outbound_tx,
        receiver: inbound_rx,
    }
}

impl Transport for WsTransport {
    async fn register(&self, preferred_id: Option<String>) -> Result<Registration, TransportError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let register = RelayFrame::Register {
            layer_id: self.layer_id.clone(),
            preferred_id,
        };
        let encoded = register
            .encode()
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;
        ws_writer
            .send(Message::Binary(encoded.into()))
            .await
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;

        let reply = tokio::time::timeout(self.register_timeout, async {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match RelayFrame::decode(&data) {
                        Ok(frame @ (RelayFrame::Registered { .. } | RelayFrame::Rejected { .. })) => {
                            return Some(frame)
                        }
                        Ok(other) => log::debug!("Ignoring {other:?} while registering"),
                        Err(e) => log::debug!("Undecodable frame while registering: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => return None,
                    _ => {}
                }
            }
            None
        })
        .await
        .map_err(|_| TransportError::Unreachable("registration timed out".into()))?;

        let (peer_id, peers) = match reply {
            Some(RelayFrame::Registered { peer_id, peers }) => (peer_id, peers),
            Some(RelayFrame::Rejected { reason }) => return Err(TransportError::Unreachable(reason)),
            _ => return Err(TransportError::Unreachable("relay closed during registration".into())),
        };

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(OUTGOING_QUEUE);
        let routes: Arc<Mutex<HashMap<ChannelKey, Route>>> = Arc::new(Mutex::new(HashMap::new()));
        let known_peers = Arc::new(Mutex::new(peers.iter().cloned().collect::<HashSet<_>>()));

        // Writer task: forward queued frames to the socket
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: demultiplex relay frames into virtual channels
        let (closed_tx, closed) = oneshot::channel();
        {
            let routes = routes.clone();
            let known_peers = known_peers.clone();
            let out_tx = out_tx.clone();
            let accept_tx = self.accept_tx.clone();
            let session_slot = self.session.clone();
            let capacity = self.channel_capacity;
            let local_id = peer_id.clone();
            tokio::spawn(async move {
                while let Some(msg) = ws_reader.next().await {
                    let data = match msg {
                        Ok(Message::Binary(data)) => data,
                        Ok(Message::Close(_)) | Err(_) => break,
                        _ => continue,
                    };
                    let frame = match RelayFrame::decode(&data) {
                        Ok(frame) => frame,
                        Err(e) => {
                            log::warn!("Undecodable relay frame: {e}");
                            continue;
                        }
                    };
                    match frame {
                        RelayFrame::Open { peer_id, key } => {
                            let channel = open_virtual(&routes, &out_tx, &peer_id, key, capacity).await;
                            if accept_tx.try_send(channel).is_err() {
                                log::warn!("Accept queue full, refusing channel from {peer_id}");
                            }
                        }
                        RelayFrame::Data { peer_id, key, bytes } => {
                            let routes = routes.lock().await;
                            match routes.get(&key) {
                                Some(route) => {
                                    if route.inbound.try_send(bytes).is_err() {
                                        log::debug!("Inbound queue from {peer_id} full, dropping");
                                    }
                                }
                                None => log::debug!("Data for unknown channel from {peer_id}"),
                            }
                        }
                        RelayFrame::Close { key, .. } => {
                            routes.lock().await.remove(&key);
                        }
                        RelayFrame::PeerJoined { peer_id } => {
                            known_peers.lock().await.insert(peer_id);
                        }
                        RelayFrame::PeerLeft { peer_id } => {
                            known_peers.lock().await.remove(&peer_id);
                            routes.lock().await.retain(|_, route| route.remote != peer_id);
                        }
                        RelayFrame::Ping => {
                            if let Ok(pong) = RelayFrame::Pong.encode() {
                                let _ = out_tx.try_send(pong);
                            }
                        }
                        other => log::debug!("Ignoring relay frame {other:?}"),
                    }
                }

                log::warn!("Relay connection lost for {local_id}");
                routes.lock().await.clear();
                let mut slot = session_slot.lock().await;
                if slot.as_ref().is_some_and(|s| s.peer_id == local_id) {
                    *slot = None;
                }
                drop(slot);
                let _ = closed_tx.send(());
            });
        }

        *self.session.lock().await = Some(Session {
            peer_id: peer_id.clone(),
            out_tx,
            routes,
            known_peers,
        });
        log::info!("Registered with relay {} as {peer_id}", self.url);

        Ok(Registration {
            peer_id,
            peers,
            closed,
        })
    }

    async fn dial(&self, peer_id: &str) -> Result<Channel, TransportError> {
        let (local_id, out_tx, routes, known) = {
            let session = self.session.lock().await;
            let session = session.as_ref().ok_or(TransportError::NotRegistered)?;
            (
                session.peer_id.clone(),
                session.out_tx.clone(),
                session.routes.clone(),
                session.known_peers.clone(),
            )
        };
        if !known.lock().await.contains(peer_id) {
            return Err(TransportError::UnknownPeer(peer_id.to_string()));
        }

        let key = ChannelKey {
            opener: local_id,
            id: self.next_channel.fetch_add(1, Ordering::Relaxed),
        };
        let channel = open_virtual(&routes, &out_tx, peer_id, key.clone(), self.channel_capacity).await;

        let open = RelayFrame::Open {
            peer_id: peer_id.to_string(),
            key,
        };
        let encoded = open.encode().map_err(|_| TransportError::Closed)?;
        out_tx.send(encoded).await.map_err(|_| TransportError::Closed)?;
        Ok(channel)
    }

    async fn accept(&self) -> Option<Channel> {
        self.accept_rx.lock().await.recv().await
    }
}
