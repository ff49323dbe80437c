//! Per-peer rolling-window rate limiting.

use lru::LruCache;
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

const SECOND: Duration = Duration::from_secs(1);
const MINUTE: Duration = Duration::from_secs(60);

/// Which window rejected a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateWindow {
    Second,
    Minute,
}

impl std::fmt::Display for RateWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RateWindow::Second => f.write_str("per-second"),
            RateWindow::Minute => f.write_str("per-minute"),
        }
    }
}

#[derive(Debug, Default)]
struct PeerWindows {
    second: VecDeque<Instant>,
    minute: VecDeque<Instant>,
}

fn evict(times: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(front) = times.front() {
        if now.duration_since(*front) >= window {
            times.pop_front();
        } else {
            break;
        }
    }
}

impl PeerWindows {
    fn check_and_record(
        &mut self,
        now: Instant,
        per_second: usize,
        per_minute: usize,
    ) -> Result<(), RateWindow> {
        evict(&mut self.second, now, SECOND);
        evict(&mut self.minute, now, MINUTE);

        if self.second.len() >= per_second {
            return Err(RateWindow::Second);
        }
        if self.minute.len() >= per_minute {
            return Err(RateWindow::Minute);
        }
        self.second.push_back(now);
        self.minute.push_back(now);
        Ok(())
    }
}

/// Tracks recent message times for a bounded number of peers.
///
/// Least recently active peers are evicted once `max_tracked` is reached;
/// an evicted peer simply starts over with empty windows.
pub struct RateLimiter {
    peers: LruCache<String, PeerWindows>,
    per_second: usize,
    per_minute: usize,
}

impl RateLimiter {
    pub fn new(per_second: usize, per_minute: usize, max_tracked: usize) -> Self {
        let cap = NonZeroUsize::new(max_tracked).unwrap_or(NonZeroUsize::MIN);
        Self {
            peers: LruCache::new(cap),
            per_second,
            per_minute,
        }
    }

    /// Record one message from `peer` at `now`, unless a window is full.
    pub fn check_and_record(&mut self, peer: &str, now: Instant) -> Result<(), RateWindow> {
        if !self.peers.contains(peer) {
            self.peers.put(peer.to_string(), PeerWindows::default());
        }
        match self.peers.get_mut(peer) {
            Some(windows) => windows.check_and_record(now, self.per_second, self.per_minute),
            None => Ok(()),
        }
    }

    pub fn forget(&mut self, peer: &str) {
        self.peers.pop(peer);
    }

    pub fn tracked(&self) -> usize {
        self.peers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_second_limit() {
        let mut limiter = RateLimiter::new(3, 100, 16);
        let t0 = Instant::now();
        for i in 0..3 {
            assert!(limiter.check_and_record("p", t0 + Duration::from_millis(i)).is_ok());
        }
        assert_eq!(
            limiter.check_and_record("p", t0 + Duration::from_millis(10)),
            Err(RateWindow::Second)
        );
        // Window rolls over
        assert!(limiter.check_and_record("p", t0 + Duration::from_millis(1_005)).is_ok());
    }

    #[test]
    fn test_per_minute_limit() {
        let mut limiter = RateLimiter::new(100, 5, 16);
        let t0 = Instant::now();
        for i in 0..5 {
            assert!(limiter.check_and_record("p", t0 + Duration::from_secs(i * 2)).is_ok());
        }
        assert_eq!(
            limiter.check_and_record("p", t0 + Duration::from_secs(20)),
            Err(RateWindow::Minute)
        );
        assert!(limiter.check_and_record("p", t0 + Duration::from_secs(61)).is_ok());
    }

    #[test]
    fn test_peers_are_independent() {
        let mut limiter = RateLimiter::new(1, 10, 16);
        let t0 = Instant::now();
        assert!(limiter.check_and_record("a", t0).is_ok());
        assert!(limiter.check_and_record("a", t0).is_err());
        assert!(limiter.check_and_record("b", t0).is_ok());
    }

    #[test]
    fn test_tracking_is_bounded() {
        let mut limiter = RateLimiter::new(1, 10, 2);
        let t0 = Instant::now();
        limiter.check_and_record("a", t0).unwrap();
        limiter.check_and_record("b", t0).unwrap();
        limiter.check_and_record("c", t0).unwrap();
        assert_eq!(limiter.tracked(), 2);
        // "a" was evicted and starts fresh
        assert!(limiter.check_and_record("a", t0).is_ok());
    }

    #[test]
    fn test_forget() {
        let mut limiter = RateLimiter::new(1, 10, 4);
        let t0 = Instant::now();
        limiter.check_and_record("a", t0).unwrap();
        limiter.forget("a");
        assert_eq!(limiter.tracked(), 0);
        assert!(limiter.check_and_record("a", t0).is_ok());
    }
}
