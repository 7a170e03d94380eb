//! Head-orientation integration from calibrated IMU samples.
//!
//! The tracker runs entirely on the stream task; nothing here is shared.
//! It first holds the device still to measure the residual gyro bias left
//! over after the factory temperature curve, then integrates gyro rates and
//! blends in accelerometer tilt with a complementary filter. Device time is
//! the only clock: a timestamp that fails to advance aborts the stream.

use crate::types::{EulerDegrees, TrackingSample};
use crate::{Error, Result};

/// One factory bias measurement at a known temperature.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GyroBiasSample {
    pub temperature_c: f32,
    pub bias: [f64; 3],
}

/// Factory bias at temperature `t`: clamped outside the sweep, linearly
/// interpolated component-wise inside it. `samples` is non-empty and sorted
/// by temperature.
pub fn interpolate_gyro_bias(samples: &[GyroBiasSample], t: f32) -> [f64; 3] {
    let (Some(first), Some(last)) = (samples.first(), samples.last()) else {
        return [0.0; 3];
    };
    if t <= first.temperature_c {
        return first.bias;
    }
    if t >= last.temperature_c {
        return last.bias;
    }
    for pair in samples.windows(2) {
        let (lo, hi) = (pair[0], pair[1]);
        if t <= hi.temperature_c {
            let span = f64::from(hi.temperature_c - lo.temperature_c);
            if span == 0.0 {
                return lo.bias;
            }
            let frac = f64::from(t - lo.temperature_c) / span;
            let mut out = [0.0; 3];
            for i in 0..3 {
                out[i] = lo.bias[i] + (hi.bias[i] - lo.bias[i]) * frac;
            }
            return out;
        }
    }
    last.bias
}

/// Wrap an angle into (−180, 180].
pub fn wrap_degrees(v: f64) -> f64 {
    let wrapped = (v + 180.0).rem_euclid(360.0) - 180.0;
    if wrapped == -180.0 {
        180.0
    } else {
        wrapped
    }
}

/// Factory bias data the tracker subtracts before integrating.
#[derive(Debug, Clone)]
pub struct BiasConfig {
    /// Accelerometer bias, already remapped into the tracker's axis frame.
    pub accel_bias: [f64; 3],
    /// Non-empty, temperature-sorted factory gyro bias sweep.
    pub gyro_temp_curve: Vec<GyroBiasSample>,
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Stillness samples accumulated before streaming begins.
    pub calibration_target: u32,
    /// Complementary-filter gyro weight.
    pub alpha: f64,
    /// Per-axis scale applied to the relative orientation.
    pub output_scale: [f64; 3],
    pub bias: BiasConfig,
}

impl TrackerConfig {
    pub fn new(bias: BiasConfig) -> Self {
        Self {
            calibration_target: 500,
            alpha: 0.98,
            output_scale: [1.0, 1.0, 1.0],
            bias,
        }
    }
}

/// One IMU sample in the tracker's axis frame.
#[derive(Debug, Clone, Copy)]
pub struct TrackerSample {
    /// Gyro rates in degrees per second.
    pub gyro: [f64; 3],
    /// Accelerometer in m/s², axis-remapped by the stream session.
    pub accel: [f64; 3],
    pub temperature_c: f32,
    pub hmd_time_ns: u64,
}

/// What one submitted sample produced.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerStep {
    /// Still accumulating stillness samples.
    Calibrating { samples: u32, target: u32 },
    /// Calibration just finished; the next sample primes the integrator.
    CalibrationComplete,
    /// First sample after calibration: timestamp recorded, nothing emitted.
    Primed,
    Updated(TrackingSample),
}

#[derive(Debug)]
enum State {
    Uncalibrated { count: u32, accum: [f64; 3] },
    Calibrated(Calibrated),
}

#[derive(Debug)]
struct Calibrated {
    residual_bias: [f64; 3],
    euler: EulerDegrees,
    zero: EulerDegrees,
    last_ts: Option<u64>,
}

#[derive(Debug)]
pub struct HeadTracker {
    config: TrackerConfig,
    state: State,
}

impl HeadTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            state: State::Uncalibrated {
                count: 0,
                accum: [0.0; 3],
            },
        }
    }

    pub fn is_calibrated(&self) -> bool {
        matches!(self.state, State::Calibrated(_))
    }

    pub fn calibration_target(&self) -> u32 {
        self.config.calibration_target
    }

    /// Drive the tracker with one axis-remapped IMU sample.
    pub fn submit(&mut self, sample: &TrackerSample) -> Result<TrackerStep> {
        match &mut self.state {
            State::Uncalibrated { count, accum } => {
                let factory = interpolate_gyro_bias(
                    &self.config.bias.gyro_temp_curve,
                    sample.temperature_c,
                );
                for i in 0..3 {
                    accum[i] += sample.gyro[i] - factory[i];
                }
                *count += 1;
                if *count < self.config.calibration_target {
                    return Ok(TrackerStep::Calibrating {
                        samples: *count,
                        target: self.config.calibration_target,
                    });
                }
                let n = f64::from(*count);
                let residual_bias = [accum[0] / n, accum[1] / n, accum[2] / n];
                log::info!(
                    "stillness calibration done after {count} samples, residual gyro bias {residual_bias:?}"
                );
                self.state = State::Calibrated(Calibrated {
                    residual_bias,
                    euler: EulerDegrees::default(),
                    zero: EulerDegrees::default(),
                    last_ts: None,
                });
                Ok(TrackerStep::CalibrationComplete)
            }
            State::Calibrated(cal) => {
                let Some(last_ts) = cal.last_ts else {
                    cal.last_ts = Some(sample.hmd_time_ns);
                    return Ok(TrackerStep::Primed);
                };
                if sample.hmd_time_ns <= last_ts {
                    return Err(Error::protocol(format!(
                        "device time went backwards: {} after {last_ts}",
                        sample.hmd_time_ns
                    )));
                }
                let dt = (sample.hmd_time_ns - last_ts) as f64 / 1e9;
                if !dt.is_finite() || dt <= 0.0 {
                    return Err(Error::protocol(format!("invalid integration interval {dt}")));
                }
                cal.last_ts = Some(sample.hmd_time_ns);

                let factory =
                    interpolate_gyro_bias(&self.config.bias.gyro_temp_curve, sample.temperature_c);
                let mut gyro = [0.0; 3];
                for i in 0..3 {
                    gyro[i] = sample.gyro[i] - factory[i] - cal.residual_bias[i];
                }

                let mut pitch = cal.euler.pitch + gyro[0] * dt;
                let mut yaw = cal.euler.yaw + gyro[1] * dt;
                let mut roll = cal.euler.roll + gyro[2] * dt;

                let accel = [
                    sample.accel[0] - self.config.bias.accel_bias[0],
                    sample.accel[1] - self.config.bias.accel_bias[1],
                    sample.accel[2] - self.config.bias.accel_bias[2],
                ];
                let norm = (accel[0] * accel[0] + accel[1] * accel[1] + accel[2] * accel[2]).sqrt();
                if norm > 0.01 {
                    let pitch_acc = (-accel[0])
                        .atan2((accel[1] * accel[1] + accel[2] * accel[2]).sqrt())
                        .to_degrees();
                    let roll_acc = accel[1].atan2(accel[2]).to_degrees();
                    let alpha = self.config.alpha;
                    pitch = alpha * pitch + (1.0 - alpha) * pitch_acc;
                    roll = alpha * roll + (1.0 - alpha) * roll_acc;
                    // Yaw has no absolute reference without the magnetometer;
                    // it stays gyro-integrated.
                }

                cal.euler = EulerDegrees {
                    pitch: wrap_degrees(pitch),
                    yaw: wrap_degrees(yaw),
                    roll: wrap_degrees(roll),
                };

                let relative = relative_orientation(cal, &self.config.output_scale);
                Ok(TrackerStep::Updated(TrackingSample {
                    absolute: cal.euler,
                    relative,
                    delta_t: dt,
                    hmd_time_ns: sample.hmd_time_ns,
                    residual_gyro_bias: cal.residual_bias,
                    factory_gyro_bias: factory,
                }))
            }
        }
    }

    /// Recenter: the current orientation becomes the identity for subsequent
    /// relative orientations. No-op while uncalibrated.
    pub fn zero_view(&mut self) {
        if let State::Calibrated(cal) = &mut self.state {
            cal.zero = cal.euler;
            log::debug!("zero view at {:?}", cal.zero);
        }
    }

    /// Drop everything, including zero-view offsets, and recalibrate from
    /// scratch.
    pub fn reset(&mut self) {
        self.state = State::Uncalibrated {
            count: 0,
            accum: [0.0; 3],
        };
    }

    /// Current relative orientation without advancing the filter.
    pub fn relative(&self) -> Option<EulerDegrees> {
        match &self.state {
            State::Calibrated(cal) => Some(relative_orientation(cal, &self.config.output_scale)),
            State::Uncalibrated { .. } => None,
        }
    }
}

fn relative_orientation(cal: &Calibrated, scale: &[f64; 3]) -> EulerDegrees {
    EulerDegrees {
        pitch: wrap_degrees((cal.euler.pitch - cal.zero.pitch) * scale[0]),
        yaw: wrap_degrees((cal.euler.yaw - cal.zero.yaw) * scale[1]),
        roll: wrap_degrees((cal.euler.roll - cal.zero.roll) * scale[2]),
    }
}
