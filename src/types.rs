use crate::error::Error;

/// Discriminates which sensor produced a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    Imu,
    Magnetometer,
}

/// One decoded inertial report from the stream socket.
///
/// All three vectors are populated regardless of [`ReportKind`]; the ones the
/// kind does not cover simply carry whatever bytes the device sent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReport {
    pub device_id: u64,
    /// Device-frame monotonic timestamp in nanoseconds.
    pub hmd_time_ns: u64,
    pub kind: ReportKind,
    /// Gyroscope rates in degrees per second.
    pub gyro: [f32; 3],
    /// Accelerometer readings in m/s².
    pub accel: [f32; 3],
    /// Magnetometer readings.
    pub mag: [f32; 3],
    pub temperature_c: f32,
    pub imu_id: u8,
    /// 24-bit rolling frame counter, least significant byte first.
    pub frame_id: [u8; 3],
}

/// Head orientation as Tait-Bryan angles in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EulerDegrees {
    pub pitch: f64,
    pub yaw: f64,
    pub roll: f64,
}

/// One fused orientation emitted per successful tracker update.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackingSample {
    /// Orientation in the calibration frame.
    pub absolute: EulerDegrees,
    /// Orientation relative to the last zero-view, output scale applied.
    pub relative: EulerDegrees,
    /// Integration interval in seconds.
    pub delta_t: f64,
    /// Device timestamp of the source report.
    pub hmd_time_ns: u64,
    /// Residual gyro bias from stillness calibration, in effect for this sample.
    pub residual_gyro_bias: [f64; 3],
    /// Factory gyro bias at the sample's temperature.
    pub factory_gyro_bias: [f64; 3],
}

/// Stream health snapshot published every diagnostics window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Diagnostics {
    pub counters: crate::framer::FramerCounters,
    /// Tracking samples per second observed over the window.
    pub observed_hz: f64,
    pub recv_delta_min_s: f64,
    pub recv_delta_avg_s: f64,
    pub recv_delta_max_s: f64,
    pub window_samples: u32,
}

/// Lifecycle of the streaming session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Idle,
    Connecting,
    Calibrating { progress: u32, target: u32 },
    Streaming,
    Error { error: Error, recoverable: bool },
    Stopped,
}

/// Lifecycle of the factory-bias table loaded from the device config.
#[derive(Debug, Clone, PartialEq)]
pub enum BiasState {
    Inactive,
    LoadingConfig,
    Active {
        fsn: String,
        glasses_version: i64,
    },
    Error {
        error: Error,
    },
}

/// Which physical button a key-state event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    FrontTopBottomSingle,
    FrontRockerButton,
    BottomSingle,
    TopSingle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Down,
    Up,
}

/// Unsolicited button event pushed by the glasses on the control socket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyEvent {
    pub key_type: KeyType,
    pub key_state: KeyState,
    pub device_time_ns: u64,
}

/// Inbound control-socket traffic that is not a transaction response.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    Key(KeyEvent),
    /// Inbound frame that matched no pending transaction (or a malformed
    /// key-state payload), kept raw for diagnosis.
    Unknown { magic: u16, payload: Vec<u8> },
}

/// Smoothing applied to the relative orientation of published samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoseDataMode {
    Raw,
    Smooth,
}

/// Identity returned once the first report has been parsed during `start()`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionInfo {
    pub fsn: String,
    pub glasses_version: i64,
}
