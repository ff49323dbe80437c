//! Peer link manager: a full mesh of direct channels for one user in one
//! layer.
//!
//! ```text
//!               initialize()
//!                    │ register ──► Transport (signaling)
//!                    ▼
//!   ┌──────── dial listed peers ─────────┐     accept loop ◄── incoming
//!   ▼                                    ▼            │
//! handshake (peer:hello ⇄ peer:hello) ◄──────────────┘
//!   │
//!   ▼
//! PeerLink { info, sender, reader task }
//!   reader: bytes ─► Validator ─► handlers (isolated)
//! ```
//!
//! Lifecycle notifications `peer:connected` / `peer:disconnected` are
//! synthesized locally and dispatched through the same handler table.
//! A supervisor task re-registers with signaling whenever the
//! registration is lost, forever, with a fixed delay.
//!
//! When two peers dial each other at the same moment, both ends keep the
//! channel dialed by the lower peer id and close the other one.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::identity::{DurableIdentity, KeyValueStore};
use crate::protocol::{Envelope, MessageType, PeerHello, PeerRole, ProtocolError};
use crate::transport::{Channel, Transport, TransportError};
use crate::validation::{Origin, ValidationConfig, Validator};

/// Link manager configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Time allowed for the remote `peer:hello`
    pub handshake_timeout_ms: u64,
    /// Fixed delay between signaling reconnect attempts
    pub reconnect_delay_ms: u64,
    /// A peer silent for this long is reported as idle
    pub idle_after_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 10_000,
            reconnect_delay_ms: 3_000,
            idle_after_ms: 30_000,
        }
    }
}

impl LinkConfig {
    pub fn for_testing() -> Self {
        Self {
            handshake_timeout_ms: 1_000,
            reconnect_delay_ms: 50,
            idle_after_ms: 5_000,
        }
    }
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Signaling unreachable: {0}")]
    Connection(String),
    #[error("Handshake with {peer} failed: {reason}")]
    Handshake { peer: String, reason: String },
    #[error("Unknown peer: {0}")]
    UnknownPeer(String),
    #[error("Channel closed")]
    ChannelClosed,
    #[error("Link manager not initialized")]
    NotInitialized,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<TransportError> for LinkError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::UnknownPeer(peer) => LinkError::UnknownPeer(peer),
            TransportError::Closed => LinkError::ChannelClosed,
            other => LinkError::Connection(other.to_string()),
        }
    }
}

/// Error returned by a message handler. Logged, never propagated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

pub type Handler = Arc<dyn Fn(&Envelope) -> Result<(), HandlerError> + Send + Sync>;

/// Signaling connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Active,
    Idle,
}

/// A connected remote peer.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub peer_id: String,
    pub user_id: String,
    pub role: PeerRole,
    pub has_control: bool,
    pub display_name: Option<String>,
    pub status: PeerStatus,
    pub last_seen: Instant,
}

struct PeerLink {
    info: PeerInfo,
    sender: mpsc::Sender<Vec<u8>>,
    reader: JoinHandle<()>,
    generation: u64,
    /// Dialed by this side.
    outbound: bool,
}

/// Link counters snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub sent: u64,
    pub dropped: u64,
    pub received: u64,
    pub rejected: u64,
}

#[derive(Default)]
struct AtomicLinkStats {
    sent: AtomicU64,
    dropped: AtomicU64,
    received: AtomicU64,
    rejected: AtomicU64,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

struct Inner<T> {
    transport: T,
    config: LinkConfig,
    local: PeerHello,
    layer_id: String,
    validator: Validator,
    preferred_peer_id: Option<String>,
    identity: Option<Arc<dyn KeyValueStore>>,
    local_peer_id: RwLock<Option<String>>,
    state: RwLock<ConnectionState>,
    peers: RwLock<HashMap<String, PeerLink>>,
    handlers: RwLock<HashMap<String, Vec<Handler>>>,
    any_handlers: RwLock<Vec<Handler>>,
    sequence: AtomicU32,
    generation: AtomicU64,
    stats: AtomicLinkStats,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    accepting: AtomicBool,
    shutdown: AtomicBool,
}

/// Builder for [`LinkManager`].
pub struct LinkManagerBuilder<T> {
    transport: T,
    local: PeerHello,
    layer_id: String,
    config: LinkConfig,
    validator: Option<Validator>,
    preferred_peer_id: Option<String>,
    identity: Option<Arc<dyn KeyValueStore>>,
}

impl<T: Transport> LinkManagerBuilder<T> {
    pub fn config(mut self, config: LinkConfig) -> Self {
        self.config = config;
        self
    }

    pub fn validator(mut self, validator: Validator) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Peer id to ask signaling for, typically the cached durable one.
    pub fn preferred_peer_id(mut self, peer_id: Option<String>) -> Self {
        self.preferred_peer_id = peer_id;
        self
    }

    /// Durable identity store. The peer id cached there is asked for
    /// first, and every id signaling assigns is written back.
    pub fn identity_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.identity = Some(store);
        self
    }

    pub fn build(self) -> LinkManager<T> {
        let validator = self
            .validator
            .unwrap_or_else(|| Validator::new(ValidationConfig::default(), self.layer_id.clone()));
        LinkManager {
            inner: Arc::new(Inner {
                transport: self.transport,
                config: self.config,
                local: self.local,
                layer_id: self.layer_id,
                validator,
                preferred_peer_id: self.preferred_peer_id,
                identity: self.identity,
                local_peer_id: RwLock::new(None),
                state: RwLock::new(ConnectionState::Disconnected),
                peers: RwLock::new(HashMap::new()),
                handlers: RwLock::new(HashMap::new()),
                any_handlers: RwLock::new(Vec::new()),
                sequence: AtomicU32::new(0),
                generation: AtomicU64::new(0),
                stats: AtomicLinkStats::default(),
                tasks: Mutex::new(Vec::new()),
                accepting: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
            }),
        }
    }
}

/// Mesh of direct channels for one user in one layer.
///
/// Cheap to clone; clones share the same mesh.
pub struct LinkManager<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for LinkManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport> LinkManager<T> {
    pub fn builder(transport: T, local: PeerHello, layer_id: impl Into<String>) -> LinkManagerBuilder<T> {
        LinkManagerBuilder {
            transport,
            local,
            layer_id: layer_id.into(),
            config: LinkConfig::default(),
            validator: None,
            preferred_peer_id: None,
            identity: None,
        }
    }

    pub fn new(transport: T, local: PeerHello, layer_id: impl Into<String>) -> Self {
        Self::builder(transport, local, layer_id).build()
    }

    /// Register with signaling and dial every listed peer.
    ///
    /// Fails only when the first registration attempt fails. Later
    /// signaling loss is handled by the reconnect supervisor.
    pub async fn initialize(&self) -> Result<String, LinkError> {
        let inner = &self.inner;
        if let Some(id) = self.local_peer_id() {
            return Ok(id);
        }
        inner.shutdown.store(false, Ordering::SeqCst);
        inner.set_state(ConnectionState::Connecting);

        let preferred = inner.cached_peer_id().or_else(|| inner.preferred_peer_id.clone());
        let registration = match inner.transport.register(preferred).await {
            Ok(registration) => registration,
            Err(e) => {
                inner.set_state(ConnectionState::Disconnected);
                log::warn!("Registration for layer {} failed: {e}", inner.layer_id);
                return Err(LinkError::Connection(e.to_string()));
            }
        };

        let peer_id = registration.peer_id.clone();
        *write(&inner.local_peer_id) = Some(peer_id.clone());
        inner.remember_peer_id(&peer_id);
        inner.set_state(ConnectionState::Connected);
        log::info!(
            "Registered as {peer_id} in layer {} ({} peers listed)",
            inner.layer_id,
            registration.peers.len()
        );

        if !inner.accepting.swap(true, Ordering::SeqCst) {
            let accept = tokio::spawn(inner.clone().accept_loop());
            inner.track(accept);
        }
        let supervisor = tokio::spawn(inner.clone().supervise(registration.closed));
        inner.track(supervisor);

        inner.dial_all(registration.peers).await;
        Ok(peer_id)
    }

    /// Open a channel to `peer_id` and exchange hellos. `info` is sent as
    /// the local hello. A no-op when already connected.
    pub async fn connect(&self, peer_id: &str, info: PeerHello) -> Result<(), LinkError> {
        if self.is_connected(peer_id) {
            return Ok(());
        }
        if self.local_peer_id().is_none() {
            return Err(LinkError::NotInitialized);
        }
        self.inner.connect_peer(peer_id, &info).await.map(|_| ())
    }

    /// Send to every open channel. Returns how many channels accepted it.
    pub fn broadcast(&self, msg_type: &str, payload: Value) -> usize {
        let inner = &self.inner;
        let Some(bytes) = inner.encode(msg_type, payload) else {
            return 0;
        };
        let peers = read(&inner.peers);
        let mut delivered = 0;
        for (peer_id, link) in peers.iter() {
            if inner.push(peer_id, &link.sender, bytes.clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Send to one peer. Full or closed channels drop the message.
    pub fn send(&self, peer_id: &str, msg_type: &str, payload: Value) -> Result<(), LinkError> {
        let inner = &self.inner;
        let sender = read(&inner.peers)
            .get(peer_id)
            .map(|link| link.sender.clone())
            .ok_or_else(|| LinkError::UnknownPeer(peer_id.to_string()))?;
        if let Some(bytes) = inner.encode(msg_type, payload) {
            inner.push(peer_id, &sender, bytes);
        }
        Ok(())
    }

    /// Register a handler for one message type.
    pub fn on<F>(&self, msg_type: &str, handler: F)
    where
        F: Fn(&Envelope) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        write(&self.inner.handlers)
            .entry(msg_type.to_string())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Register a handler for every message type.
    pub fn on_all<F>(&self, handler: F)
    where
        F: Fn(&Envelope) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        write(&self.inner.any_handlers).push(Arc::new(handler));
    }

    /// Close the channel to `peer_id` and emit `peer:disconnected`.
    pub fn disconnect(&self, peer_id: &str) -> bool {
        let inner = &self.inner;
        match inner.remove_peer(peer_id, None) {
            Some(link) => {
                link.reader.abort();
                inner.validator.forget(&link.info.user_id);
                log::info!("Disconnected from {peer_id}");
                inner.notify(MessageType::PeerDisconnected, &link.info);
                true
            }
            None => false,
        }
    }

    /// Toggle the locally tracked control flag of a peer.
    pub fn set_control(&self, peer_id: &str, has_control: bool) -> Result<(), LinkError> {
        let mut peers = write(&self.inner.peers);
        let link = peers
            .get_mut(peer_id)
            .ok_or_else(|| LinkError::UnknownPeer(peer_id.to_string()))?;
        link.info.has_control = has_control;
        Ok(())
    }

    /// Stop every task and drop every channel.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        inner.shutdown.store(true, Ordering::SeqCst);
        let tasks: Vec<JoinHandle<()>> = inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
        inner.accepting.store(false, Ordering::SeqCst);

        let links: Vec<PeerLink> = write(&inner.peers).drain().map(|(_, link)| link).collect();
        for link in links {
            link.reader.abort();
            inner.notify(MessageType::PeerDisconnected, &link.info);
        }
        *write(&inner.local_peer_id) = None;
        inner.set_state(ConnectionState::Disconnected);
        log::info!("Link manager for layer {} shut down", inner.layer_id);
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        let idle_after = Duration::from_millis(self.inner.config.idle_after_ms);
        let mut peers: Vec<PeerInfo> = read(&self.inner.peers)
            .values()
            .map(|link| {
                let mut info = link.info.clone();
                if info.last_seen.elapsed() > idle_after {
                    info.status = PeerStatus::Idle;
                }
                info
            })
            .collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        peers
    }

    pub fn peer(&self, peer_id: &str) -> Option<PeerInfo> {
        read(&self.inner.peers).get(peer_id).map(|link| link.info.clone())
    }

    pub fn peer_count(&self) -> usize {
        read(&self.inner.peers).len()
    }

    pub fn is_connected(&self, peer_id: &str) -> bool {
        read(&self.inner.peers).contains_key(peer_id)
    }

    pub fn local_peer_id(&self) -> Option<String> {
        read(&self.inner.local_peer_id).clone()
    }

    pub fn local_user_id(&self) -> &str {
        &self.inner.local.user_id
    }

    pub fn layer_id(&self) -> &str {
        &self.inner.layer_id
    }

    pub fn connection_state(&self) -> ConnectionState {
        *read(&self.inner.state)
    }

    pub fn stats(&self) -> LinkStats {
        let s = &self.inner.stats;
        LinkStats {
            sent: s.sent.load(Ordering::Relaxed),
            dropped: s.dropped.load(Ordering::Relaxed),
            received: s.received.load(Ordering::Relaxed),
            rejected: s.rejected.load(Ordering::Relaxed),
        }
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }
}

impl<T: Transport> Inner<T> {
    fn set_state(&self, state: ConnectionState) {
        *write(&self.state) = state;
    }

    fn cached_peer_id(&self) -> Option<String> {
        let store = self.identity.as_deref()?;
        match DurableIdentity::get_or_create(store) {
            Ok(identity) => identity.peer_id,
            Err(e) => {
                log::warn!("Could not read durable identity: {e}");
                None
            }
        }
    }

    fn remember_peer_id(&self, peer_id: &str) {
        let Some(store) = self.identity.as_deref() else {
            return;
        };
        let result = DurableIdentity::get_or_create(store)
            .and_then(|mut identity| identity.remember_peer_id(store, peer_id));
        if let Err(e) = result {
            log::warn!("Could not persist peer id {peer_id}: {e}");
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    fn envelope(&self, msg_type: &str, payload: Value) -> Envelope {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        Envelope::new(msg_type, self.local.user_id.clone(), self.layer_id.clone(), sequence, payload)
    }

    fn encode(&self, msg_type: &str, payload: Value) -> Option<Vec<u8>> {
        match self.envelope(msg_type, payload).encode() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                log::warn!("Failed to encode {msg_type}: {e}");
                None
            }
        }
    }

    fn push(&self, peer_id: &str, sender: &mpsc::Sender<Vec<u8>>, bytes: Vec<u8>) -> bool {
        match sender.try_send(bytes) {
            Ok(()) => {
                self.stats.sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("Dropped message to {peer_id}: {e}");
                false
            }
        }
    }

    async fn accept_loop(self: Arc<Self>) {
        while let Some(channel) = self.transport.accept().await {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            let inner = self.clone();
            tokio::spawn(async move {
                let peer_id = channel.peer_id.clone();
                let hello = inner.local.clone();
                if let Err(e) = inner.handshake(channel, &hello, false).await {
                    log::warn!("Incoming channel from {peer_id} rejected: {e}");
                }
            });
        }
        log::debug!("Accept loop for layer {} ended", self.layer_id);
    }

    async fn supervise(self: Arc<Self>, mut closed: oneshot::Receiver<()>) {
        let delay = Duration::from_millis(self.config.reconnect_delay_ms);
        loop {
            let _ = (&mut closed).await;
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            self.set_state(ConnectionState::Reconnecting);
            log::warn!("Signaling lost for layer {}, reconnecting", self.layer_id);

            loop {
                tokio::time::sleep(delay).await;
                if self.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                let current = read(&self.local_peer_id).clone();
                let preferred = current.clone().or_else(|| self.preferred_peer_id.clone());
                match self.transport.register(preferred).await {
                    Ok(registration) => {
                        if current.as_deref() != Some(registration.peer_id.as_str()) {
                            log::warn!(
                                "Peer id changed from {current:?} to {}",
                                registration.peer_id
                            );
                        }
                        *write(&self.local_peer_id) = Some(registration.peer_id.clone());
                        self.remember_peer_id(&registration.peer_id);
                        self.set_state(ConnectionState::Connected);
                        log::info!("Reconnected to signaling as {}", registration.peer_id);

                        closed = registration.closed;
                        let missing: Vec<String> = {
                            let peers = read(&self.peers);
                            registration
                                .peers
                                .into_iter()
                                .filter(|p| !peers.contains_key(p))
                                .collect()
                        };
                        self.dial_all(missing).await;
                        break;
                    }
                    Err(e) => log::warn!("Reconnect failed: {e}; retrying in {delay:?}"),
                }
            }
        }
    }

    async fn dial_all(self: &Arc<Self>, peers: Vec<String>) {
        let hello = self.local.clone();
        let attempts = peers.iter().map(|peer_id| {
            let hello = &hello;
            async move {
                if let Err(e) = self.connect_peer(peer_id, hello).await {
                    log::warn!("Could not connect to {peer_id}: {e}");
                }
            }
        });
        futures_util::future::join_all(attempts).await;
    }

    async fn connect_peer(self: &Arc<Self>, peer_id: &str, hello: &PeerHello) -> Result<PeerInfo, LinkError> {
        if let Some(link) = read(&self.peers).get(peer_id) {
            return Ok(link.info.clone());
        }
        let channel = self.transport.dial(peer_id).await?;
        self.handshake(channel, hello, true).await
    }

    /// Exchange hellos, then start the reader. Anything but a valid hello
    /// arriving first is dropped.
    async fn handshake(
        self: &Arc<Self>,
        mut channel: Channel,
        hello: &PeerHello,
        outbound: bool,
    ) -> Result<PeerInfo, LinkError> {
        let remote = channel.peer_id.clone();
        let hello_payload = serde_json::to_value(hello)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        let bytes = self
            .envelope(MessageType::PeerHello.as_str(), hello_payload)
            .encode()?;
        channel
            .sender
            .send(bytes)
            .await
            .map_err(|_| LinkError::ChannelClosed)?;

        let timeout = Duration::from_millis(self.config.handshake_timeout_ms);
        let receiver = &mut channel.receiver;
        let remote_hello = tokio::time::timeout(timeout, async {
            while let Some(bytes) = receiver.recv().await {
                match self.validator.validate(&bytes, Origin::unbound(&remote)) {
                    Ok(env) if env.is(MessageType::PeerHello) => {
                        let hello: PeerHello = match env.payload_as() {
                            Ok(hello) => hello,
                            Err(e) => return Err(LinkError::Protocol(e)),
                        };
                        if hello.user_id != env.user_id {
                            return Err(LinkError::Handshake {
                                peer: remote.clone(),
                                reason: "hello user id does not match envelope".into(),
                            });
                        }
                        return Ok(hello);
                    }
                    Ok(env) => {
                        log::debug!("Dropping {} from {remote} before handshake", env.msg_type);
                    }
                    Err(e) => {
                        self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                        log::warn!("Rejected handshake message from {remote}: {e}");
                    }
                }
            }
            Err(LinkError::ChannelClosed)
        })
        .await
        .map_err(|_| LinkError::Handshake {
            peer: remote.clone(),
            reason: format!("no hello within {timeout:?}"),
        })??;

        Ok(self.register_peer(remote, remote_hello, channel, outbound))
    }

    fn register_peer(
        self: &Arc<Self>,
        peer_id: String,
        hello: PeerHello,
        channel: Channel,
        outbound: bool,
    ) -> PeerInfo {
        let Channel {
            sender, receiver, ..
        } = channel;
        let info = PeerInfo {
            peer_id: peer_id.clone(),
            user_id: hello.user_id.clone(),
            role: hello.role,
            has_control: hello.has_control,
            display_name: hello.display_name,
            status: PeerStatus::Active,
            last_seen: Instant::now(),
        };

        let local_id = read(&self.local_peer_id).clone().unwrap_or_default();
        let preferred = outbound == (local_id.as_str() < peer_id.as_str());

        {
            let mut peers = write(&self.peers);
            if let Some(existing) = peers.get_mut(&peer_id) {
                if existing.outbound == outbound || !preferred {
                    log::debug!("Already linked to {peer_id}, dropping duplicate channel");
                    return existing.info.clone();
                }
                // Crossed dial: swap in the channel the lower id dialed.
                log::debug!("Crossed dial with {peer_id}, keeping the channel dialed by the lower id");
                let kept = existing.info.clone();
                let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                let reader = tokio::spawn(self.clone().read_loop(
                    peer_id.clone(),
                    kept.user_id.clone(),
                    receiver,
                    generation,
                ));
                let replaced = std::mem::replace(
                    existing,
                    PeerLink {
                        info: kept.clone(),
                        sender,
                        reader,
                        generation,
                        outbound,
                    },
                );
                replaced.reader.abort();
                return kept;
            }
            let generation = self.generation.fetch_add(1, Ordering::Relaxed);
            let reader = tokio::spawn(self.clone().read_loop(
                peer_id.clone(),
                info.user_id.clone(),
                receiver,
                generation,
            ));
            peers.insert(
                peer_id.clone(),
                PeerLink {
                    info: info.clone(),
                    sender,
                    reader,
                    generation,
                    outbound,
                },
            );
        }

        log::info!("Connected to {peer_id} (user {})", info.user_id);
        self.notify(MessageType::PeerConnected, &info);
        info
    }

    async fn read_loop(
        self: Arc<Self>,
        peer_id: String,
        user_id: String,
        mut receiver: mpsc::Receiver<Vec<u8>>,
        generation: u64,
    ) {
        while let Some(bytes) = receiver.recv().await {
            match self.validator.validate(&bytes, Origin::bound(&peer_id, &user_id)) {
                Ok(env) if env.is(MessageType::PeerHello) => {
                    log::debug!("Ignoring repeated hello from {peer_id}");
                }
                Ok(env) => {
                    self.stats.received.fetch_add(1, Ordering::Relaxed);
                    if let Some(link) = write(&self.peers).get_mut(&peer_id) {
                        link.info.last_seen = Instant::now();
                        link.info.status = PeerStatus::Active;
                    }
                    self.dispatch(&env);
                }
                Err(e) => {
                    self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                    log::warn!("Rejected message from {peer_id}: {e}");
                }
            }
        }

        if let Some(link) = self.remove_peer(&peer_id, Some(generation)) {
            self.validator.forget(&link.info.user_id);
            log::info!("Channel to {peer_id} closed by remote");
            self.notify(MessageType::PeerDisconnected, &link.info);
        }
    }

    fn remove_peer(&self, peer_id: &str, generation: Option<u64>) -> Option<PeerLink> {
        let mut peers = write(&self.peers);
        match (peers.get(peer_id), generation) {
            (Some(link), Some(g)) if link.generation != g => None,
            (Some(_), _) => peers.remove(peer_id),
            (None, _) => None,
        }
    }

    /// Run every matching handler. Failures and panics are contained.
    fn dispatch(&self, env: &Envelope) {
        let specific: Vec<Handler> = read(&self.handlers)
            .get(&env.msg_type)
            .cloned()
            .unwrap_or_default();
        let any: Vec<Handler> = read(&self.any_handlers).clone();

        for handler in specific.iter().chain(any.iter()) {
            match catch_unwind(AssertUnwindSafe(|| handler(env))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::warn!("Handler for {} failed: {e}", env.msg_type),
                Err(_) => log::error!("Handler for {} panicked", env.msg_type),
            }
        }
    }

    fn notify(&self, kind: MessageType, info: &PeerInfo) {
        let env = Envelope::new(
            kind.as_str(),
            info.user_id.clone(),
            self.layer_id.clone(),
            0,
            json!({
                "peerId": info.peer_id,
                "userId": info.user_id,
                "role": info.role.as_str(),
                "hasControl": info.has_control,
            }),
        );
        self.dispatch(&env);
    }
}
