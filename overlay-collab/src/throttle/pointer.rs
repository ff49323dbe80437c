use std::time::Instant;

use serde_json::json;

use super::{AdaptiveThrottle, Sample, ThrottleConfig, Vec2};
use crate::link::LinkManager;
use crate::protocol::MessageType;
use crate::transport::Transport;

/// Local pointer feed: throttled `mouse:move` broadcasts.
pub struct PointerStream<T: Transport> {
    link: LinkManager<T>,
    throttle: AdaptiveThrottle,
}

impl<T: Transport> PointerStream<T> {
    pub fn new(link: LinkManager<T>, config: ThrottleConfig) -> Self {
        Self {
            link,
            throttle: AdaptiveThrottle::new(config),
        }
    }

    /// Returns `true` when the sample went out.
    pub fn move_to(&mut self, position: Vec2, now: Instant) -> bool {
        match self.throttle.sample(position, now) {
            Some(sample) => {
                self.send(sample);
                true
            }
            None => false,
        }
    }

    /// Pointer left the page: deliver the final position, then `mouse:leave`.
    pub fn leave(&mut self, now: Instant) {
        if let Some(sample) = self.throttle.flush(now) {
            self.send(sample);
        }
        self.throttle.reset();
        self.link.broadcast(MessageType::MouseLeave.as_str(), json!({}));
    }

    fn send(&self, sample: Sample) {
        self.link.broadcast(
            MessageType::MouseMove.as_str(),
            json!({
                "u": sample.position.x.clamp(0.0, 1.0),
                "v": sample.position.y.clamp(0.0, 1.0),
                "velocity": sample.velocity,
            }),
        );
    }
}

/// Local scroll feed: throttled `scroll:update` broadcasts.
pub struct ScrollStream<T: Transport> {
    link: LinkManager<T>,
    throttle: AdaptiveThrottle,
}

impl<T: Transport> ScrollStream<T> {
    pub fn new(link: LinkManager<T>, config: ThrottleConfig) -> Self {
        Self {
            link,
            throttle: AdaptiveThrottle::new(config),
        }
    }

    pub fn scroll_to(&mut self, offset: Vec2, now: Instant) -> bool {
        match self.throttle.sample(offset, now) {
            Some(sample) => {
                self.send(sample.position);
                true
            }
            None => false,
        }
    }

    /// Scrolling settled: deliver the retained offset, if any.
    pub fn settle(&mut self, now: Instant) -> bool {
        match self.throttle.flush(now) {
            Some(sample) => {
                self.send(sample.position);
                true
            }
            None => false,
        }
    }

    fn send(&self, offset: Vec2) {
        self.link.broadcast(
            MessageType::ScrollUpdate.as_str(),
            json!({
                "x": offset.x.clamp(0.0, 1.0),
                "y": offset.y.clamp(0.0, 1.0),
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkConfig;
    use crate::protocol::{PeerHello, PeerRole};
    use crate::transport::{MemoryNetwork, MemoryTransport};
    use crate::validation::{ValidationConfig, Validator};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn manager(net: &MemoryNetwork, user: &str, peer: &str) -> LinkManager<MemoryTransport> {
        LinkManager::builder(
            MemoryTransport::new(net),
            PeerHello::new(user, PeerRole::Editor),
            "layer",
        )
        .config(LinkConfig::for_testing())
        .validator(Validator::new(ValidationConfig::for_testing(), "layer"))
        .preferred_peer_id(Some(peer.to_string()))
        .build()
    }

    #[tokio::test]
    async fn test_pointer_leave_flushes_final_position() {
        let net = MemoryNetwork::new();
        let a = manager(&net, "alice", "a");
        let b = manager(&net, "bob", "b");
        a.initialize().await.unwrap();
        b.initialize().await.unwrap();

        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        a.on_all(move |env| {
            if env.msg_type.starts_with("mouse:") {
                sink.lock().unwrap().push(env.msg_type.clone());
            }
            Ok(())
        });

        let mut stream = PointerStream::new(b.clone(), ThrottleConfig::default());
        let start = Instant::now();
        assert!(stream.move_to(Vec2::new(0.1, 0.1), start));
        assert!(!stream.move_to(Vec2::new(0.11, 0.1), start + Duration::from_millis(2)));
        stream.leave(start + Duration::from_millis(3));

        for _ in 0..100 {
            if seen.lock().unwrap().len() >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["mouse:move", "mouse:move", "mouse:leave"]
        );

        a.shutdown();
        b.shutdown();
    }
}
