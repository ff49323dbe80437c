use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{EventBuffer, EventType, NewEvent, SessionRecord, SessionStore, StoreError};
use crate::backend::WorkspaceBackend;
use crate::link::{HandlerError, LinkManager};
use crate::protocol::Envelope;
use crate::transport::Transport;

/// Recorder batching thresholds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Flush once this many events are buffered. Default: 100.
    pub max_buffered_events: usize,
    /// Flush once buffered payloads reach this size. Default: 64KB.
    pub max_buffered_bytes: usize,
    /// Flush events older than this. Default: 1s.
    pub flush_interval_ms: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            max_buffered_events: 100,
            max_buffered_bytes: 64 * 1024,
            flush_interval_ms: 1000,
        }
    }
}

impl RecorderConfig {
    pub fn for_testing() -> Self {
        Self {
            max_buffered_events: 10,
            max_buffered_bytes: 4 * 1024,
            flush_interval_ms: 20,
        }
    }
}

/// Buffers a layer's actions and commits them to one session.
pub struct SessionRecorder {
    store: Arc<SessionStore>,
    session: SessionRecord,
    config: RecorderConfig,
    buffer: Mutex<EventBuffer>,
    /// Serializes commits so drain order is append order.
    flushing: Mutex<()>,
}

impl SessionRecorder {
    /// Start a new session in `layer_id`.
    pub fn new(store: Arc<SessionStore>, layer_id: &str, config: RecorderConfig) -> Result<Self, StoreError> {
        let session = store.create_session(layer_id)?;
        Ok(Self::with_session(store, session, config))
    }

    /// Continue appending to an existing session.
    pub fn resume(store: Arc<SessionStore>, session_id: Uuid, config: RecorderConfig) -> Result<Self, StoreError> {
        let session = store.session(session_id)?;
        Ok(Self::with_session(store, session, config))
    }

    fn with_session(store: Arc<SessionStore>, session: SessionRecord, config: RecorderConfig) -> Self {
        Self {
            buffer: Mutex::new(EventBuffer::new(&config)),
            flushing: Mutex::new(()),
            store,
            session,
            config,
        }
    }

    fn buffer(&self) -> MutexGuard<'_, EventBuffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn session_id(&self) -> Uuid {
        self.session.session_id
    }

    pub fn session(&self) -> &SessionRecord {
        &self.session
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn pending(&self) -> usize {
        self.buffer().buffered_count()
    }

    /// Buffer one action, committing when a threshold is reached.
    pub fn record(&self, user_id: &str, event_type: EventType, payload: Value) -> Result<(), StoreError> {
        self.push(NewEvent::now(user_id, event_type, payload))
    }

    /// Buffer an event with its own timestamp.
    pub fn push(&self, event: NewEvent) -> Result<(), StoreError> {
        let due = self.buffer().push(event);
        if due {
            self.flush()?;
        }
        Ok(())
    }

    /// Log an inbound envelope. Returns `false` for types that are not logged.
    pub fn record_envelope(&self, envelope: &Envelope) -> Result<bool, StoreError> {
        let Some(event_type) = envelope.kind().and_then(EventType::for_message) else {
            return Ok(false);
        };
        self.push(NewEvent::at(
            envelope.user_id.clone(),
            event_type,
            envelope.payload.clone(),
            envelope.timestamp,
        ))?;
        Ok(true)
    }

    /// Commit everything buffered in one batch. On failure the events stay
    /// buffered, ahead of anything recorded meanwhile.
    pub fn flush(&self) -> Result<usize, StoreError> {
        let _commit = self.flushing.lock().unwrap_or_else(PoisonError::into_inner);
        let events = self.buffer().drain();
        if events.is_empty() {
            return Ok(0);
        }
        let count = events.len();
        match self.store.append_batch(self.session.session_id, events.clone()) {
            Ok(_) => Ok(count),
            Err(e) => {
                self.buffer().restore(events);
                Err(e)
            }
        }
    }

    /// Log every inbound message on `link`.
    pub fn attach<T: Transport>(self: &Arc<Self>, link: &LinkManager<T>) {
        let recorder = Arc::clone(self);
        link.on_all(move |env| {
            recorder
                .record_envelope(env)
                .map(|_| ())
                .map_err(|e| HandlerError::new(e.to_string()))
        });
    }

    /// Periodic age-based flush. Ends once the recorder is dropped.
    pub fn spawn_flush_task(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = Duration::from_millis(self.config.flush_interval_ms.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(recorder) = weak.upgrade() else {
                    break;
                };
                let due = recorder.buffer().is_due();
                if due {
                    if let Err(e) = recorder.flush() {
                        log::error!("Session {} flush failed: {e}", recorder.session_id());
                    }
                }
            }
        })
    }

    /// Flush, then hand the whole session to the backend.
    /// Returns the backend's id for the upload.
    pub async fn upload<B: WorkspaceBackend>(&self, backend: &B) -> Result<String, StoreError> {
        self.flush()?;
        let events = self.store.events(self.session.session_id)?;
        let count = events.len();
        let remote_id = backend.submit_events(&self.session.layer_id, events).await?;
        log::info!(
            "Uploaded session {} ({count} events) as {remote_id}",
            self.session.session_id
        );
        Ok(remote_id)
    }
}
