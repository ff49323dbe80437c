//! Adaptive sampling of continuous local signals and smoothing of sparse
//! remote ones.
//!
//! ```text
//! local pointer ──► AdaptiveThrottle ──► LinkManager::broadcast
//!                     (interval from velocity)
//!
//! mouse:move ──► CursorTracker ──► Interpolator per peer ──► watch frames
//!                                   (ticked while any peer is tracked)
//! ```
//!
//! Coordinates are unit-agnostic. The overlay sends normalized page
//! coordinates, so a velocity of 1.0 means one page extent per second.

mod cursor;
mod interpolate;
mod pointer;

pub use cursor::{CursorFrame, CursorTracker};
pub use interpolate::{Interpolator, InterpolatorConfig};
pub use pointer::{PointerStream, ScrollStream};

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// 2D position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f64,
    pub y: f64,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another point.
    pub fn distance(&self, other: &Vec2) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }

    /// Linear interpolation toward `target` by factor `t` ∈ [0, 1].
    pub fn lerp(&self, target: &Vec2, t: f64) -> Vec2 {
        Vec2 {
            x: self.x + (target.x - self.x) * t,
            y: self.y + (target.y - self.y) * t,
        }
    }
}

impl Default for Vec2 {
    fn default() -> Self {
        Self::ZERO
    }
}

/// Throttle configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Emission interval at or above `velocity_threshold`
    pub min_interval_ms: u64,
    /// Emission interval when stationary
    pub max_interval_ms: u64,
    /// Velocity (units per second) that earns `min_interval_ms`
    pub velocity_threshold: f64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 16,
            max_interval_ms: 100,
            velocity_threshold: 1.0,
        }
    }
}

/// A position with the velocity observed when it was sampled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub position: Vec2,
    /// Units per second
    pub velocity: f64,
    pub at: Instant,
}

/// Per-signal sampler. One instance per independent stream.
#[derive(Debug, Clone)]
pub struct AdaptiveThrottle {
    config: ThrottleConfig,
    last: Option<(Vec2, Instant)>,
    last_velocity: f64,
    last_emit: Option<Instant>,
    pending: Option<Sample>,
}

impl AdaptiveThrottle {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            last: None,
            last_velocity: 0.0,
            last_emit: None,
            pending: None,
        }
    }

    /// Emission interval for `velocity`, interpolated linearly between the
    /// configured bounds.
    pub fn interval_for(&self, velocity: f64) -> Duration {
        let min = self.config.min_interval_ms.min(self.config.max_interval_ms) as f64;
        let max = self.config.max_interval_ms.max(self.config.min_interval_ms) as f64;
        let t = if self.config.velocity_threshold <= 0.0 {
            1.0
        } else {
            (velocity / self.config.velocity_threshold).clamp(0.0, 1.0)
        };
        let millis = max - (max - min) * t;
        Duration::from_micros((millis * 1000.0).round() as u64)
    }

    /// Feed one sample. Returns it (with velocity) when it is due,
    /// otherwise keeps it as the last known position.
    pub fn sample(&mut self, position: Vec2, now: Instant) -> Option<Sample> {
        let velocity = match self.last {
            Some((prev, at)) => {
                let dt = now.saturating_duration_since(at).as_secs_f64();
                if dt > 0.0 {
                    prev.distance(&position) / dt
                } else {
                    self.last_velocity
                }
            }
            None => 0.0,
        };
        self.last = Some((position, now));
        self.last_velocity = velocity;

        let sample = Sample {
            position,
            velocity,
            at: now,
        };
        let due = match self.last_emit {
            None => true,
            Some(at) => now.saturating_duration_since(at) >= self.interval_for(velocity),
        };
        if due {
            self.last_emit = Some(now);
            self.pending = None;
            Some(sample)
        } else {
            self.pending = Some(sample);
            None
        }
    }

    /// Emit the retained sample once, regardless of timing.
    pub fn flush(&mut self, now: Instant) -> Option<Sample> {
        let sample = self.pending.take()?;
        self.last_emit = Some(now);
        Some(sample)
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Forget all history, as after the signal leaves the page.
    pub fn reset(&mut self) {
        self.last = None;
        self.last_velocity = 0.0;
        self.last_emit = None;
        self.pending = None;
    }
}
