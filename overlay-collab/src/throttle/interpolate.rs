use serde::Deserialize;

use super::Vec2;

/// Interpolator tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InterpolatorConfig {
    /// Lerp factor applied every tick
    pub base_factor: f64,
    /// Extra factor per unit of incoming velocity
    pub velocity_gain: f64,
    /// Upper bound on the velocity boost
    pub boost_cap: f64,
    /// Below this distance the current position jumps to the target
    pub snap_threshold: f64,
    /// Display tick period
    pub tick_interval_ms: u64,
}

impl Default for InterpolatorConfig {
    fn default() -> Self {
        Self {
            base_factor: 0.15,
            velocity_gain: 0.1,
            boost_cap: 0.35,
            snap_threshold: 0.001,
            tick_interval_ms: 16,
        }
    }
}

/// Eases a rendered position toward the last received one.
///
/// Fast incoming motion eases in quicker to cut visible lag, slow motion
/// eases gently to hide jitter.
#[derive(Debug, Clone)]
pub struct Interpolator {
    current: Vec2,
    target: Vec2,
    velocity: f64,
    config: InterpolatorConfig,
}

impl Interpolator {
    pub fn new(position: Vec2, config: InterpolatorConfig) -> Self {
        Self {
            current: position,
            target: position,
            velocity: 0.0,
            config,
        }
    }

    pub fn set_target(&mut self, target: Vec2, velocity: f64) {
        self.target = target;
        self.velocity = velocity.max(0.0);
    }

    /// Lerp factor for the last received velocity.
    pub fn factor(&self) -> f64 {
        let boost = (self.velocity * self.config.velocity_gain).min(self.config.boost_cap);
        (self.config.base_factor + boost).clamp(0.0, 1.0)
    }

    /// Advance one display frame.
    pub fn tick(&mut self) -> Vec2 {
        if self.current.distance(&self.target) < self.config.snap_threshold {
            self.current = self.target;
        } else {
            self.current = self.current.lerp(&self.target, self.factor());
        }
        self.current
    }

    pub fn position(&self) -> Vec2 {
        self.current
    }

    pub fn target(&self) -> Vec2 {
        self.target
    }

    pub fn is_settled(&self) -> bool {
        self.current == self.target
    }
}
