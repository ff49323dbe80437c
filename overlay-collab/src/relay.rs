//! WebSocket signaling and relay server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                                   ┌── Client C
//!            ├── LayerRoom ("layer-1") ──────────┤
//! Client B ──┘     │                             └── (other layers isolated)
//!                  ├── members: peer_id → outbound queue   (point-to-point)
//!                  └── events: broadcast channel            (join / leave fan-out)
//! ```
//!
//! A client's first frame must be `Register`. The relay assigns a peer id
//! (the preferred one when it is free in that layer), replies with the
//! current member list, and announces the newcomer to the room. After that,
//! `Open`/`Data`/`Close` frames addressed to a member are rewritten to carry
//! the sender's id and forwarded. Delivery is best-effort: a full member
//! queue drops the frame and counts it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::RelayFrame;

/// Relay configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per layer
    pub max_peers_per_layer: usize,
    /// Join/leave broadcast capacity per layer
    pub broadcast_capacity: usize,
    /// Outbound frame queue per peer
    pub peer_queue_capacity: usize,
    /// Frames larger than this are dropped
    pub max_frame_bytes: usize,
    /// Time allowed between socket accept and `Register`
    pub register_timeout_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_layer: 64,
            broadcast_capacity: 256,
            peer_queue_capacity: 1024,
            max_frame_bytes: 256 * 1024,
            register_timeout_ms: 10_000,
        }
    }
}

impl RelayConfig {
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            max_peers_per_layer: 8,
            broadcast_capacity: 32,
            peer_queue_capacity: 128,
            max_frame_bytes: 64 * 1024,
            register_timeout_ms: 1_000,
        }
    }
}

/// Relay statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_relayed: u64,
    pub bytes_relayed: u64,
    pub frames_dropped: u64,
    pub active_layers: usize,
}

/// Lock-free counters behind [`RelayStats`].
#[derive(Default)]
struct AtomicRelayStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    frames_relayed: AtomicU64,
    bytes_relayed: AtomicU64,
    frames_dropped: AtomicU64,
}

/// Join/leave announcement fanned out to a layer.
#[derive(Debug)]
struct RoomEvent {
    origin: String,
    frame: Vec<u8>,
}

/// Why a peer could not join a layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinError {
    LayerFull,
}

/// Members of one layer plus their fan-out channel.
pub struct LayerRoom {
    events: broadcast::Sender<Arc<RoomEvent>>,
    members: RwLock<HashMap<String, mpsc::Sender<Vec<u8>>>>,
    max_members: usize,
}

impl LayerRoom {
    fn new(capacity: usize, max_members: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            events,
            members: RwLock::new(HashMap::new()),
            max_members,
        }
    }

    /// Add a member. Returns the assigned id and the ids already present.
    async fn join(
        &self,
        preferred_id: Option<String>,
        queue: mpsc::Sender<Vec<u8>>,
    ) -> Result<(String, Vec<String>), JoinError> {
        let mut members = self.members.write().await;
        if members.len() >= self.max_members {
            return Err(JoinError::LayerFull);
        }
        let peer_id = match preferred_id {
            Some(id) if !id.is_empty() && !members.contains_key(&id) => id,
            _ => format!("peer-{}", uuid::Uuid::new_v4()),
        };
        let existing = members.keys().cloned().collect();
        members.insert(peer_id.clone(), queue);
        Ok((peer_id, existing))
    }

    async fn leave(&self, peer_id: &str) -> bool {
        self.members.write().await.remove(peer_id).is_some()
    }

    async fn member(&self, peer_id: &str) -> Option<mpsc::Sender<Vec<u8>>> {
        self.members.read().await.get(peer_id).cloned()
    }

    fn announce(&self, origin: &str, frame: &RelayFrame) {
        match frame.encode() {
            Ok(bytes) => {
                let _ = self.events.send(Arc::new(RoomEvent {
                    origin: origin.to_string(),
                    frame: bytes,
                }));
            }
            Err(e) => log::error!("Failed to encode room event: {e}"),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<Arc<RoomEvent>> {
        self.events.subscribe()
    }

    pub async fn peer_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.members.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Layer id → room.
pub struct LayerRooms {
    rooms: RwLock<HashMap<String, Arc<LayerRoom>>>,
    broadcast_capacity: usize,
    max_members: usize,
}

impl LayerRooms {
    pub fn new(broadcast_capacity: usize, max_members: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            broadcast_capacity,
            max_members,
        }
    }

    /// Get or create the room for a layer.
    pub async fn get_or_create(&self, layer_id: &str) -> Arc<LayerRoom> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(layer_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(layer_id) {
            return room.clone();
        }
        let room = Arc::new(LayerRoom::new(self.broadcast_capacity, self.max_members));
        rooms.insert(layer_id.to_string(), room.clone());
        room
    }

    pub async fn get(&self, layer_id: &str) -> Option<Arc<LayerRoom>> {
        self.rooms.read().await.get(layer_id).cloned()
    }

    /// Remove a room with no members left.
    pub async fn remove_if_empty(&self, layer_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(layer_id) {
            if room.peer_count().await == 0 {
                rooms.remove(layer_id);
                return true;
            }
        }
        false
    }

    pub async fn layer_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    rooms: Arc<LayerRooms>,
    stats: Arc<AtomicRelayStats>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let rooms = Arc::new(LayerRooms::new(
            config.broadcast_capacity,
            config.max_peers_per_layer,
        ));
        Self {
            config,
            rooms,
            stats: Arc::new(AtomicRelayStats::default()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind to the configured address and serve forever.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats, config).await {
                    log::warn!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle one client socket from `Register` to close.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Arc<LayerRooms>,
        stats: Arc<AtomicRelayStats>,
        config: RelayConfig,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let register_timeout = Duration::from_millis(config.register_timeout_ms);
        let (layer_id, preferred_id) =
            match tokio::time::timeout(register_timeout, Self::read_register(&mut ws_receiver)).await {
                Ok(Some(registration)) => registration,
                Ok(None) => {
                    log::debug!("{addr} closed before registering");
                    return Ok(());
                }
                Err(_) => {
                    log::warn!("{addr} did not register within {register_timeout:?}");
                    return Ok(());
                }
            };

        let room = rooms.get_or_create(&layer_id).await;
        let (queue_tx, mut queue_rx) = mpsc::channel::<Vec<u8>>(config.peer_queue_capacity.max(1));
        let mut events_rx = room.subscribe();

        let (peer_id, peers) = match room.join(preferred_id, queue_tx).await {
            Ok(joined) => joined,
            Err(JoinError::LayerFull) => {
                let reject = RelayFrame::Rejected {
                    reason: format!("layer {layer_id} is full"),
                };
                ws_sender.send(Message::Binary(reject.encode()?.into())).await?;
                rooms.remove_if_empty(&layer_id).await;
                return Ok(());
            }
        };

        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);
        log::info!("Peer {peer_id} joined layer {layer_id} from {addr}");

        let registered = RelayFrame::Registered {
            peer_id: peer_id.clone(),
            peers,
        };
        let result = async {
            ws_sender
                .send(Message::Binary(registered.encode()?.into()))
                .await?;
            room.announce(
                &peer_id,
                &RelayFrame::PeerJoined {
                    peer_id: peer_id.clone(),
                },
            );

            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                let bytes: Vec<u8> = data.into();
                                if bytes.len() > config.max_frame_bytes {
                                    log::warn!("Dropping {} byte frame from {peer_id}", bytes.len());
                                    stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                                    continue;
                                }
                                match RelayFrame::decode(&bytes) {
                                    Ok(RelayFrame::Ping) => {
                                        ws_sender.send(Message::Binary(RelayFrame::Pong.encode()?.into())).await?;
                                    }
                                    Ok(frame) => {
                                        if let Some(bounce) = Self::route(&room, &peer_id, frame, &stats).await {
                                            ws_sender.send(Message::Binary(bounce.encode()?.into())).await?;
                                        }
                                    }
                                    Err(e) => log::warn!("Failed to decode frame from {peer_id}: {e}"),
                                }
                            }
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }
                            Some(Err(e)) => {
                                log::warn!("WebSocket error from {addr}: {e}");
                                break;
                            }
                            _ => {}
                        }
                    }

                    queued = queue_rx.recv() => {
                        match queued {
                            Some(bytes) => ws_sender.send(Message::Binary(bytes.into())).await?,
                            None => break,
                        }
                    }

                    event = events_rx.recv() => {
                        match event {
                            Ok(event) if event.origin != peer_id => {
                                ws_sender.send(Message::Binary(event.frame.clone().into())).await?;
                            }
                            Ok(_) => {}
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                log::warn!("Peer {peer_id} lagged by {n} room events");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
            Ok::<(), BoxError>(())
        }
        .await;

        room.leave(&peer_id).await;
        room.announce(
            &peer_id,
            &RelayFrame::PeerLeft {
                peer_id: peer_id.clone(),
            },
        );
        if rooms.remove_if_empty(&layer_id).await {
            log::info!("Layer {layer_id} removed (empty)");
        }
        stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::info!("Peer {peer_id} left layer {layer_id}");

        result
    }

    /// Wait for the `Register` frame that opens every session.
    async fn read_register<S>(ws_receiver: &mut S) -> Option<(String, Option<String>)>
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Binary(data)) => match RelayFrame::decode(&data) {
                    Ok(RelayFrame::Register {
                        layer_id,
                        preferred_id,
                    }) => return Some((layer_id, preferred_id)),
                    Ok(other) => log::debug!("Ignoring {other:?} before Register"),
                    Err(e) => log::debug!("Undecodable frame before Register: {e}"),
                },
                Ok(Message::Close(_)) | Err(_) => return None,
                _ => {}
            }
        }
        None
    }

    /// Forward a channel frame to its destination. Returns a frame to send
    /// back to the origin when the destination is gone.
    async fn route(
        room: &LayerRoom,
        origin: &str,
        frame: RelayFrame,
        stats: &AtomicRelayStats,
    ) -> Option<RelayFrame> {
        let (dest, rewritten) = match frame {
            RelayFrame::Open { peer_id, key } => (
                peer_id,
                RelayFrame::Open {
                    peer_id: origin.to_string(),
                    key,
                },
            ),
            RelayFrame::Data {
                peer_id,
                key,
                bytes,
            } => (
                peer_id,
                RelayFrame::Data {
                    peer_id: origin.to_string(),
                    key,
                    bytes,
                },
            ),
            RelayFrame::Close { peer_id, key } => (
                peer_id,
                RelayFrame::Close {
                    peer_id: origin.to_string(),
                    key,
                },
            ),
            other => {
                log::debug!("Unroutable frame from {origin}: {other:?}");
                return None;
            }
        };

        let Some(queue) = room.member(&dest).await else {
            stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return match rewritten {
                RelayFrame::Open { key, .. } | RelayFrame::Data { key, .. } => {
                    Some(RelayFrame::Close { peer_id: dest, key })
                }
                _ => None,
            };
        };

        let bytes = match rewritten.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("Failed to encode relayed frame: {e}");
                return None;
            }
        };
        let len = bytes.len() as u64;
        match queue.try_send(bytes) {
            Ok(()) => {
                stats.frames_relayed.fetch_add(1, Ordering::Relaxed);
                stats.bytes_relayed.fetch_add(len, Ordering::Relaxed);
            }
            Err(_) => {
                stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("Queue for {dest} full, dropping frame from {origin}");
            }
        }
        None
    }

    /// Get relay statistics.
    pub async fn stats(&self) -> RelayStats {
        RelayStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            frames_relayed: self.stats.frames_relayed.load(Ordering::Relaxed),
            bytes_relayed: self.stats.bytes_relayed.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
            active_layers: self.rooms.layer_count().await,
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn rooms(&self) -> &Arc<LayerRooms> {
        &self.rooms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ChannelKey;

    #[test]
    fn test_relay_config_default() {
        let config = RelayConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_peers_per_layer, 64);
        assert_eq!(config.peer_queue_capacity, 1024);
    }

    #[test]
    fn test_relay_config_from_json_partial() {
        let config: RelayConfig =
            serde_json::from_str(r#"{"bind_addr":"0.0.0.0:7000","max_peers_per_layer":3}"#).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.max_peers_per_layer, 3);
        assert_eq!(config.broadcast_capacity, 256);
    }

    #[tokio::test]
    async fn test_relay_stats_initial() {
        let server = RelayServer::with_defaults();
        assert_eq!(server.stats().await, RelayStats::default());
    }

    #[tokio::test]
    async fn test_room_join_honours_preferred_id() {
        let room = LayerRoom::new(8, 4);
        let (tx, _rx) = mpsc::channel(4);
        let (id, peers) = room.join(Some("alice".into()), tx.clone()).await.unwrap();
        assert_eq!(id, "alice");
        assert!(peers.is_empty());

        let (id2, peers2) = room.join(Some("alice".into()), tx).await.unwrap();
        assert_ne!(id2, "alice");
        assert_eq!(peers2, vec!["alice".to_string()]);
        assert_eq!(room.peer_count().await, 2);
    }

    #[tokio::test]
    async fn test_room_full() {
        let room = LayerRoom::new(8, 1);
        let (tx, _rx) = mpsc::channel(4);
        room.join(None, tx.clone()).await.unwrap();
        assert_eq!(room.join(None, tx).await.unwrap_err(), JoinError::LayerFull);
    }

    #[tokio::test]
    async fn test_rooms_remove_if_empty() {
        let rooms = LayerRooms::new(8, 4);
        let room = rooms.get_or_create("l1").await;
        let (tx, _rx) = mpsc::channel(4);
        let (id, _) = room.join(None, tx).await.unwrap();

        assert!(!rooms.remove_if_empty("l1").await);
        room.leave(&id).await;
        assert!(rooms.remove_if_empty("l1").await);
        assert_eq!(rooms.layer_count().await, 0);
    }

    #[tokio::test]
    async fn test_route_rewrites_origin() {
        let room = LayerRoom::new(8, 4);
        let stats = AtomicRelayStats::default();
        let (tx_b, mut rx_b) = mpsc::channel(4);
        room.join(Some("b".into()), tx_b).await.unwrap();

        let key = ChannelKey { opener: "a".into(), id: 1 };
        let bounce = RelayServer::route(
            &room,
            "a",
            RelayFrame::Data {
                peer_id: "b".into(),
                key: key.clone(),
                bytes: vec![9],
            },
            &stats,
        )
        .await;
        assert!(bounce.is_none());

        let delivered = RelayFrame::decode(&rx_b.recv().await.unwrap()).unwrap();
        assert_eq!(
            delivered,
            RelayFrame::Data {
                peer_id: "a".into(),
                key,
                bytes: vec![9],
            }
        );
        assert_eq!(stats.frames_relayed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_route_to_missing_peer_bounces_close() {
        let room = LayerRoom::new(8, 4);
        let stats = AtomicRelayStats::default();
        let key = ChannelKey { opener: "a".into(), id: 2 };

        let bounce = RelayServer::route(
            &room,
            "a",
            RelayFrame::Open {
                peer_id: "ghost".into(),
                key: key.clone(),
            },
            &stats,
        )
        .await;
        assert_eq!(
            bounce,
            Some(RelayFrame::Close {
                peer_id: "ghost".into(),
                key,
            })
        );
        assert_eq!(stats.frames_dropped.load(Ordering::Relaxed), 1);
    }
}
