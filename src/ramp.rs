//! Blend weights used to fade corrective forces in and out.
//!
//! All ramps are built on the quintic smoothstep `x³(6x² − 15x + 10)`, which
//! is C² continuous and saturates exactly at 0 and 1, so a variable-step
//! integrator never sees a jump in force or in its first two derivatives.

use serde::{Deserialize, Serialize};

/// Quintic smoothstep on `[0, 1]`, clamped outside.
pub fn smoothstep(x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }
    x * x * x * (x * (6.0 * x - 15.0) + 10.0)
}

/// Rising blend weight: 0 for `t <= onset`, 1 for `t >= onset + tau`.
///
/// A non-positive `tau` degenerates to a step at `onset` (0 for
/// `t <= onset`, 1 afterwards). The step is discontinuous, so callers that
/// feed an adaptive integrator should only use it deliberately.
pub fn rising_weight(t: f64, onset: f64, tau: f64) -> f64 {
    if t <= onset {
        return 0.0;
    }
    if tau <= 0.0 || t >= onset + tau {
        return 1.0;
    }
    smoothstep((t - onset) / tau)
}

/// Falling blend weight, the reflection of [`rising_weight`].
pub fn falling_weight(t: f64, offset: f64, tau: f64) -> f64 {
    1.0 - rising_weight(t, offset, tau)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RampDirection {
    Rising,
    Falling,
}

/// A single ramp edge.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ramp {
    pub start: f64,
    pub tau: f64,
    pub direction: RampDirection,
}

impl Ramp {
    pub fn rising(start: f64, tau: f64) -> Self {
        Self {
            start,
            tau,
            direction: RampDirection::Rising,
        }
    }

    pub fn falling(start: f64, tau: f64) -> Self {
        Self {
            start,
            tau,
            direction: RampDirection::Falling,
        }
    }

    pub fn weight(&self, t: f64) -> f64 {
        match self.direction {
            RampDirection::Rising => rising_weight(t, self.start, self.tau),
            RampDirection::Falling => falling_weight(t, self.start, self.tau),
        }
    }

    /// True when the ramp switches instantaneously.
    pub fn is_step(&self) -> bool {
        self.tau <= 0.0
    }

    /// Time at which the ramp has saturated.
    pub fn end(&self) -> f64 {
        self.start + self.tau.max(0.0)
    }
}
