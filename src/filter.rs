//! 1-euro smoothing of relative orientation angles.
//!
//! Angles live on a circle, so each axis is unwrapped before the low-pass
//! (the wrapped per-step delta accumulates into a continuous value) and
//! re-wrapped on output. The cutoff adapts to the angular rate:
//! `min_cutoff + beta·|derivative|`, which keeps slow drift steady without
//! lagging fast head motion.

use crate::tracker::wrap_degrees;
use crate::types::EulerDegrees;

#[derive(Debug, Clone, Copy)]
pub struct OneEuroConfig {
    /// Cutoff frequency (Hz) at zero angular rate.
    pub min_cutoff: f64,
    /// Cutoff gain per unit of filtered derivative.
    pub beta: f64,
    /// Cutoff (Hz) for the derivative low-pass.
    pub derivative_cutoff: f64,
    /// Longest Δt (seconds) still treated as continuous motion; anything
    /// larger re-primes the filter.
    pub max_delta: f64,
}

impl Default for OneEuroConfig {
    fn default() -> Self {
        Self {
            min_cutoff: 1.0,
            beta: 0.02,
            derivative_cutoff: 1.0,
            max_delta: 0.5,
        }
    }
}

fn smoothing_factor(dt: f64, cutoff: f64) -> f64 {
    let r = 2.0 * std::f64::consts::PI * cutoff * dt;
    r / (r + 1.0)
}

/// 1-euro filter over one angular axis.
#[derive(Debug, Clone)]
pub struct OneEuroAngle {
    config: OneEuroConfig,
    primed: bool,
    /// Continuous (unwrapped) input, advanced by wrapped per-step deltas.
    unwrapped: f64,
    /// Last wrapped input, used to compute the next wrapped delta.
    last_input: f64,
    /// Filtered unwrapped value.
    smoothed: f64,
    /// Filtered derivative (degrees per second).
    derivative: f64,
}

impl OneEuroAngle {
    pub fn new(config: OneEuroConfig) -> Self {
        Self {
            config,
            primed: false,
            unwrapped: 0.0,
            last_input: 0.0,
            smoothed: 0.0,
            derivative: 0.0,
        }
    }

    /// Seed every piece of state from one sample.
    pub fn prime(&mut self, angle: f64) {
        self.primed = true;
        self.unwrapped = angle;
        self.last_input = angle;
        self.smoothed = angle;
        self.derivative = 0.0;
    }

    pub fn reset(&mut self) {
        self.primed = false;
    }

    /// Filter one sample. An unusable Δt re-primes from the sample instead
    /// of smoothing across the gap.
    pub fn filter(&mut self, angle: f64, dt: f64) -> f64 {
        if !self.primed || !dt.is_finite() || dt <= 0.0 || dt > self.config.max_delta {
            self.prime(angle);
            return wrap_degrees(angle);
        }

        let step = wrap_degrees(angle - self.last_input);
        self.last_input = angle;
        self.unwrapped += step;

        let raw_derivative = (self.unwrapped - self.smoothed) / dt;
        let da = smoothing_factor(dt, self.config.derivative_cutoff);
        self.derivative += da * (raw_derivative - self.derivative);

        let cutoff = self.config.min_cutoff + self.config.beta * self.derivative.abs();
        let a = smoothing_factor(dt, cutoff);
        self.smoothed += a * (self.unwrapped - self.smoothed);

        // Keep both accumulators bounded so years of spinning cannot degrade
        // the float resolution.
        let rewrapped = wrap_degrees(self.smoothed);
        self.unwrapped -= self.smoothed - rewrapped;
        self.smoothed = rewrapped;

        self.smoothed
    }
}

/// Per-axis smoothing of a relative orientation.
#[derive(Debug, Clone)]
pub struct EulerSmoother {
    pitch: OneEuroAngle,
    yaw: OneEuroAngle,
    roll: OneEuroAngle,
}

impl EulerSmoother {
    pub fn new(config: OneEuroConfig) -> Self {
        Self {
            pitch: OneEuroAngle::new(config),
            yaw: OneEuroAngle::new(config),
            roll: OneEuroAngle::new(config),
        }
    }

    pub fn reset(&mut self) {
        self.pitch.reset();
        self.yaw.reset();
        self.roll.reset();
    }

    pub fn filter(&mut self, euler: EulerDegrees, dt: f64) -> EulerDegrees {
        EulerDegrees {
            pitch: self.pitch.filter(euler.pitch, dt),
            yaw: self.yaw.filter(euler.yaw, dt),
            roll: self.roll.filter(euler.roll, dt),
        }
    }
}
