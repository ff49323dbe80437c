//! In-memory staging for recorded events.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                EventBuffer                   │
//! │                                              │
//! │  [ event | event | event | ... ]             │
//! │                                              │
//! │  Flush when:                                 │
//! │    1. count ≥ max_buffered_events            │
//! │    2. bytes ≥ max_buffered_bytes             │
//! │    3. age  ≥ flush_interval_ms               │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Events carry no sequence here; the store assigns one at commit.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::NewEvent;
use super::recorder::RecorderConfig;

pub struct EventBuffer {
    max_events: usize,
    max_bytes: usize,
    max_age: Duration,
    events: VecDeque<NewEvent>,
    bytes: usize,
    /// When the oldest buffered event arrived
    oldest: Option<Instant>,
    total_buffered: u64,
    total_drained: u64,
}

impl EventBuffer {
    pub fn new(config: &RecorderConfig) -> Self {
        Self {
            max_events: config.max_buffered_events.max(1),
            max_bytes: config.max_buffered_bytes,
            max_age: Duration::from_millis(config.flush_interval_ms),
            events: VecDeque::with_capacity(config.max_buffered_events),
            bytes: 0,
            oldest: None,
            total_buffered: 0,
            total_drained: 0,
        }
    }

    /// Stage an event. Returns whether a flush is now due.
    pub fn push(&mut self, event: NewEvent) -> bool {
        self.bytes += event.approx_size();
        self.events.push_back(event);
        self.oldest.get_or_insert_with(Instant::now);
        self.total_buffered += 1;
        self.needs_flush()
    }

    /// Count or byte threshold reached.
    pub fn needs_flush(&self) -> bool {
        self.events.len() >= self.max_events || self.bytes >= self.max_bytes
    }

    /// Oldest event has waited past the flush interval.
    pub fn is_due(&self) -> bool {
        self.oldest.is_some_and(|t| t.elapsed() >= self.max_age)
    }

    /// Take everything buffered, oldest first.
    pub fn drain(&mut self) -> Vec<NewEvent> {
        if self.events.is_empty() {
            return Vec::new();
        }
        let events: Vec<NewEvent> = self.events.drain(..).collect();
        self.bytes = 0;
        self.oldest = None;
        self.total_drained += events.len() as u64;
        events
    }

    /// Put back events from a failed flush, ahead of anything buffered since.
    pub fn restore(&mut self, events: Vec<NewEvent>) {
        if events.is_empty() {
            return;
        }
        self.total_drained -= (events.len() as u64).min(self.total_drained);
        for event in events.into_iter().rev() {
            self.bytes += event.approx_size();
            self.events.push_front(event);
        }
        self.oldest = Some(Instant::now());
    }

    pub fn buffered_count(&self) -> usize {
        self.events.len()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn total_buffered(&self) -> u64 {
        self.total_buffered
    }

    pub fn total_drained(&self) -> u64 {
        self.total_drained
    }
}
