use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{Interpolator, InterpolatorConfig, Vec2};
use crate::link::{HandlerError, LinkManager};
use crate::protocol::MessageType;
use crate::transport::Transport;

/// Rendered cursor positions keyed by user id.
pub type CursorFrame = BTreeMap<String, Vec2>;

struct TrackerInner {
    config: InterpolatorConfig,
    cursors: Mutex<HashMap<String, Interpolator>>,
    /// Open links per user; one user may join from several tabs.
    links: Mutex<HashMap<String, usize>>,
    frames: watch::Sender<CursorFrame>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl TrackerInner {
    fn cursors(&self) -> MutexGuard<'_, HashMap<String, Interpolator>> {
        self.cursors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn links(&self) -> MutexGuard<'_, HashMap<String, usize>> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Advance every cursor one frame and publish. Returns how many
    /// cursors remain tracked.
    fn tick(&self) -> usize {
        let frame: CursorFrame = self
            .cursors()
            .iter_mut()
            .map(|(user, interp)| (user.clone(), interp.tick()))
            .collect();
        let tracked = frame.len();
        self.frames.send_replace(frame);
        tracked
    }

    fn publish(&self) {
        let frame: CursorFrame = self
            .cursors()
            .iter()
            .map(|(user, interp)| (user.clone(), interp.position()))
            .collect();
        self.frames.send_replace(frame);
    }
}

#[derive(Deserialize)]
struct MovePayload {
    u: f64,
    v: f64,
    #[serde(default)]
    velocity: f64,
}

/// Smooths every remote cursor in a layer.
///
/// The display tick runs only while at least one cursor is tracked. Without
/// a tokio runtime the tracker still works but must be ticked by hand.
#[derive(Clone)]
pub struct CursorTracker {
    inner: Arc<TrackerInner>,
}

impl CursorTracker {
    pub fn new(config: InterpolatorConfig) -> Self {
        let (frames, _) = watch::channel(CursorFrame::new());
        Self {
            inner: Arc::new(TrackerInner {
                config,
                cursors: Mutex::new(HashMap::new()),
                links: Mutex::new(HashMap::new()),
                frames,
                ticker: Mutex::new(None),
            }),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<CursorFrame> {
        self.inner.frames.subscribe()
    }

    /// New target for `user_id`. A first update places the cursor directly.
    pub fn update(&self, user_id: &str, position: Vec2, velocity: f64) {
        {
            let mut cursors = self.inner.cursors();
            cursors
                .entry(user_id.to_string())
                .or_insert_with(|| Interpolator::new(position, self.inner.config.clone()))
                .set_target(position, velocity);
        }
        self.ensure_ticking();
    }

    /// Drop a cursor. Stops the tick once nothing is tracked.
    pub fn remove(&self, user_id: &str) -> bool {
        let (removed, empty) = {
            let mut cursors = self.inner.cursors();
            (cursors.remove(user_id).is_some(), cursors.is_empty())
        };
        if empty {
            self.stop_ticking();
        }
        if removed {
            self.inner.publish();
        }
        removed
    }

    /// Count one more open link for `user_id`.
    pub fn link_opened(&self, user_id: &str) {
        *self.inner.links().entry(user_id.to_string()).or_insert(0) += 1;
    }

    /// Count a closed link. The cursor goes with the user's last link;
    /// returns whether it was dropped.
    pub fn link_closed(&self, user_id: &str) -> bool {
        let last = {
            let mut links = self.inner.links();
            match links.get_mut(user_id) {
                Some(open) if *open > 1 => {
                    *open -= 1;
                    false
                }
                _ => {
                    links.remove(user_id);
                    true
                }
            }
        };
        last && self.remove(user_id)
    }

    /// Advance one frame by hand.
    pub fn tick(&self) -> usize {
        self.inner.tick()
    }

    pub fn position(&self, user_id: &str) -> Option<Vec2> {
        self.inner.cursors().get(user_id).map(Interpolator::position)
    }

    pub fn tracked(&self) -> usize {
        self.inner.cursors().len()
    }

    pub fn is_ticking(&self) -> bool {
        self.inner
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Follow `mouse:move`, `mouse:leave` and peer lifecycle on a link.
    pub fn attach<T: Transport>(&self, link: &LinkManager<T>) {
        for peer in link.peers() {
            self.link_opened(&peer.user_id);
        }

        let tracker = self.clone();
        link.on(MessageType::MouseMove.as_str(), move |env| {
            let mv: MovePayload = env
                .payload_as()
                .map_err(|e| HandlerError::new(e.to_string()))?;
            tracker.update(&env.user_id, Vec2::new(mv.u, mv.v), mv.velocity);
            Ok(())
        });

        let tracker = self.clone();
        link.on(MessageType::MouseLeave.as_str(), move |env| {
            tracker.remove(&env.user_id);
            Ok(())
        });

        let tracker = self.clone();
        link.on(MessageType::PeerConnected.as_str(), move |env| {
            if let Some(user) = env.payload.get("userId").and_then(|u| u.as_str()) {
                tracker.link_opened(user);
            }
            Ok(())
        });

        let tracker = self.clone();
        link.on(MessageType::PeerDisconnected.as_str(), move |env| {
            if let Some(user) = env.payload.get("userId").and_then(|u| u.as_str()) {
                tracker.link_closed(user);
            }
            Ok(())
        });
    }

    fn ensure_ticking(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let mut ticker = self.inner.ticker.lock().unwrap_or_else(PoisonError::into_inner);
        if ticker.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let period = Duration::from_millis(self.inner.config.tick_interval_ms.max(1));
        let weak: Weak<TrackerInner> = Arc::downgrade(&self.inner);
        *ticker = Some(runtime.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if inner.tick() == 0 {
                    break;
                }
            }
            log::debug!("Cursor tick stopped");
        }));
    }

    fn stop_ticking(&self) {
        if let Some(task) = self
            .inner
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

impl Default for CursorTracker {
    fn default() -> Self {
        Self::new(InterpolatorConfig::default())
    }
}
