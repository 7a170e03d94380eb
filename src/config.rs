//! Device-calibration payload parsing and validation.
//!
//! The glasses answer `get_config` with a JSON document produced at the
//! factory. Instead of deserializing into loosely-optional structs, this
//! module walks the tree with an explicit path so every rejection names the
//! exact location and reason. Cross-field invariants (grid arity versus
//! row/col counts, monotone temperature sweeps, fixed neutral values) are
//! enforced here, before any number reaches the tracker.

use serde_json::Value;

use crate::tracker::{interpolate_gyro_bias, GyroBiasSample};
use crate::{Error, Result};

/// Firmware generations this client knows how to drive.
const ACCEPTED_GLASSES_VERSIONS: [i64; 2] = [7, 8];

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Fully validated calibration payload.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    pub glasses_version: i64,
    /// Factory serial number.
    pub fsn: String,
    pub last_modified_time: String,
    pub display: DisplayConfig,
    pub distortion: DisplayDistortion,
    pub rgb_camera: Option<CameraCalibration>,
    pub slam_camera: Option<SlamCameraCalibration>,
    pub imu: ImuCalibration,
    raw: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DisplayConfig {
    pub left: DisplayEye,
    pub right: DisplayEye,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DisplayEye {
    /// 3×3 row-major projection.
    pub intrinsic: [f64; 9],
    /// 3×4 row-major pose.
    pub transform: [f64; 12],
}

#[derive(Debug, Clone, PartialEq)]
pub struct DisplayDistortion {
    pub left: DistortionGrid,
    pub right: DistortionGrid,
}

/// N×M warp grid mapping source to corrected display coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct DistortionGrid {
    pub num_row: u32,
    pub num_col: u32,
    pub points: Vec<GridPoint>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridPoint {
    pub u: f64,
    pub v: f64,
    pub x: f64,
    pub y: f64,
}

/// Radial camera model shared by the RGB and SLAM cameras.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraCalibration {
    pub cc: [f64; 2],
    pub fc: [f64; 2],
    pub kc: [f64; 5],
    pub resolution: [u32; 2],
    pub rolling_shutter_s: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SlamCameraCalibration {
    pub camera: CameraCalibration,
    pub imu_from_camera: RigidTransform,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RigidTransform {
    /// 3×3 row-major rotation.
    pub rotation: [f64; 9],
    pub translation: [f64; 3],
}

/// Noise model for one sensor (accelerometer or gyroscope).
#[derive(Debug, Clone, PartialEq)]
pub struct SensorIntrinsic {
    pub peak_to_peak: [f64; 3],
    pub std: [f64; 3],
    pub bias: [f64; 3],
    /// 3×3 row-major calibration matrix.
    pub calibration_matrix: [f64; 9],
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImuCalibration {
    pub accel_bias: [f64; 3],
    pub gyro_bias: [f64; 3],
    /// Temperature sweep of factory gyro biases, non-decreasing in
    /// temperature and never empty.
    pub gyro_bias_temp_data: Vec<GyroBiasSample>,
    pub magnetometer_transform: RigidTransform,
    pub accel_intrinsic: SensorIntrinsic,
    pub gyro_intrinsic: SensorIntrinsic,
    /// Sample-count window of the device's static detector.
    pub static_detect_window: u32,
    pub mean_temperature: f64,
    pub noise: [f64; 4],
}

impl ImuCalibration {
    /// Factory gyro bias at temperature `t`, clamped at the sweep edges and
    /// linearly interpolated inside it.
    pub fn gyro_bias_at(&self, t: f32) -> [f64; 3] {
        interpolate_gyro_bias(&self.gyro_bias_temp_data, t)
    }
}

impl DeviceConfig {
    /// Parse and validate a calibration payload.
    pub fn parse(raw: &str) -> Result<DeviceConfig> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| Error::Parse(e.to_string()))?;
        let root = Node {
            value: &value,
            path: "$".to_string(),
        };

        let glasses_version = root.child("glasses_version")?.integer()?;
        if !ACCEPTED_GLASSES_VERSIONS.contains(&glasses_version) {
            return Err(Error::schema(
                "$.glasses_version",
                format!("unsupported glasses_version {glasses_version}, expected one of {ACCEPTED_GLASSES_VERSIONS:?}"),
            ));
        }

        let fsn = root.child("FSN")?.string()?;
        let last_modified_time = root.child("last_modified_time")?.string()?;
        let ts_node = root.child("last_modified_time")?;
        if chrono::NaiveDateTime::parse_from_str(&last_modified_time, TIMESTAMP_FORMAT).is_err() {
            return Err(Error::schema(
                ts_node.path,
                format!("timestamp {last_modified_time:?} does not match {TIMESTAMP_FORMAT:?}"),
            ));
        }

        let target_type = root.child("target_type")?;
        let target = target_type.string()?;
        if target != "IMU" {
            return Err(Error::schema(
                target_type.path,
                format!("expected \"IMU\", got {target:?}"),
            ));
        }

        let display = parse_display(&root.child("display")?)?;
        let distortion = parse_distortion(&root.child("display_distortion")?)?;
        let rgb_camera = match root.opt_child("RGB_camera")? {
            Some(node) => Some(parse_camera(&node)?),
            None => None,
        };
        let slam_camera = match root.opt_child("SLAM_camera")? {
            Some(node) => Some(parse_slam_camera(&node)?),
            None => None,
        };
        let imu = parse_imu(&root.child("IMU")?.child("device_1")?)?;

        Ok(DeviceConfig {
            glasses_version,
            fsn,
            last_modified_time,
            display,
            distortion,
            rgb_camera,
            slam_camera,
            imu,
            raw: raw.to_string(),
        })
    }

    /// The untouched JSON payload this config was parsed from.
    pub fn raw_json(&self) -> &str {
        &self.raw
    }
}

fn parse_display(node: &Node) -> Result<DisplayConfig> {
    let num = node.child("num_of_displays")?;
    let n = num.integer()?;
    if n != 2 {
        return Err(Error::schema(num.path, format!("expected 2 displays, got {n}")));
    }
    Ok(DisplayConfig {
        left: parse_display_eye(&node.child("left_display")?)?,
        right: parse_display_eye(&node.child("right_display")?)?,
    })
}

fn parse_display_eye(node: &Node) -> Result<DisplayEye> {
    Ok(DisplayEye {
        intrinsic: node.child("intrinsic")?.numbers()?,
        transform: node.child("transform")?.numbers()?,
    })
}

fn parse_distortion(node: &Node) -> Result<DisplayDistortion> {
    Ok(DisplayDistortion {
        left: parse_grid(&node.child("left_display")?)?,
        right: parse_grid(&node.child("right_display")?)?,
    })
}

fn parse_grid(node: &Node) -> Result<DistortionGrid> {
    let num_row = node.child("num_row")?.unsigned()?;
    let num_col = node.child("num_col")?.unsigned()?;
    let data_node = node.child("data")?;
    let data = data_node.number_vec()?;
    if data.len() % 4 != 0 {
        return Err(Error::schema(
            data_node.path,
            format!("grid data length {} is not a multiple of 4", data.len()),
        ));
    }
    let cells = data.len() / 4;
    if cells as u64 != u64::from(num_row) * u64::from(num_col) {
        return Err(Error::schema(
            data_node.path,
            format!(
                "grid data holds {cells} points, expected num_row*num_col = {}",
                u64::from(num_row) * u64::from(num_col)
            ),
        ));
    }
    let points = data
        .chunks_exact(4)
        .map(|quad| GridPoint {
            u: quad[0],
            v: quad[1],
            x: quad[2],
            y: quad[3],
        })
        .collect();
    Ok(DistortionGrid {
        num_row,
        num_col,
        points,
    })
}

fn parse_camera(node: &Node) -> Result<CameraCalibration> {
    let num = node.child("num_of_cameras")?;
    let n = num.integer()?;
    if n != 1 {
        return Err(Error::schema(num.path, format!("expected 1 camera, got {n}")));
    }
    let resolution_f: [f64; 2] = node.child("resolution")?.numbers()?;
    let res_node = node.child("resolution")?;
    let mut resolution = [0u32; 2];
    for (i, v) in resolution_f.iter().enumerate() {
        resolution[i] = integral_u32(*v)
            .ok_or_else(|| Error::schema(format!("{}[{i}]", res_node.path), format!("{v} is not a non-negative integer")))?;
    }
    Ok(CameraCalibration {
        cc: node.child("cc")?.numbers()?,
        fc: node.child("fc")?.numbers()?,
        kc: node.child("kc")?.numbers()?,
        resolution,
        rolling_shutter_s: node.child("rolling_shutter_s")?.number()?,
    })
}

fn parse_slam_camera(node: &Node) -> Result<SlamCameraCalibration> {
    Ok(SlamCameraCalibration {
        camera: parse_camera(node)?,
        imu_from_camera: parse_transform(&node.child("imu_from_camera")?)?,
    })
}

fn parse_transform(node: &Node) -> Result<RigidTransform> {
    Ok(RigidTransform {
        rotation: node.child("rotation")?.numbers()?,
        translation: node.child("translation")?.numbers()?,
    })
}

fn parse_intrinsic(node: &Node) -> Result<SensorIntrinsic> {
    Ok(SensorIntrinsic {
        peak_to_peak: node.child("peak_to_peak")?.numbers()?,
        std: node.child("std")?.numbers()?,
        bias: node.child("bias")?.numbers()?,
        calibration_matrix: node.child("calibration_matrix")?.numbers()?,
    })
}

fn parse_imu(node: &Node) -> Result<ImuCalibration> {
    // Values the factory always writes as the same constants. Anything else
    // means an unknown calibration scheme this client must not integrate.
    expect_fixed(&node.child("accel_q_gyro")?, &[0.0, 0.0, 0.0, 1.0])?;
    expect_fixed(&node.child("accel_p_gyro")?, &[0.0, 0.0, 0.0])?;
    expect_fixed(&node.child("scale_accel")?, &[1.0, 1.0, 1.0])?;
    expect_fixed(&node.child("scale_gyro")?, &[1.0, 1.0, 1.0])?;
    expect_fixed(&node.child("skew_accel")?, &[0.0, 0.0, 0.0])?;
    expect_fixed(&node.child("skew_gyro")?, &[0.0, 0.0, 0.0])?;

    let sweep_node = node.child("gyro_bias_temp_data")?;
    let gyro_bias_temp_data = parse_bias_sweep(&sweep_node)?;

    let window_node = node.child("static_detect_window")?;
    let static_detect_window = window_node.unsigned()?;
    if static_detect_window == 0 {
        return Err(Error::schema(window_node.path, "window size must be at least 1"));
    }

    Ok(ImuCalibration {
        accel_bias: node.child("accel_bias")?.numbers()?,
        gyro_bias: node.child("gyro_bias")?.numbers()?,
        gyro_bias_temp_data,
        magnetometer_transform: parse_transform(&node.child("magnetometer_transform")?)?,
        accel_intrinsic: parse_intrinsic(&node.child("accel_intrinsic")?)?,
        gyro_intrinsic: parse_intrinsic(&node.child("gyro_intrinsic")?)?,
        static_detect_window,
        mean_temperature: node.child("mean_temperature")?.number()?,
        noise: node.child("noise")?.numbers()?,
    })
}

/// Each sweep entry is a flat `[temperature, bias_x, bias_y, bias_z]` quad.
fn parse_bias_sweep(node: &Node) -> Result<Vec<GyroBiasSample>> {
    let entries = node.array()?;
    if entries.is_empty() {
        return Err(Error::schema(node.path.clone(), "temperature sweep is empty"));
    }
    let mut samples = Vec::with_capacity(entries.len());
    for (i, entry) in entries.iter().enumerate() {
        let entry_node = Node {
            value: entry,
            path: format!("{}[{i}]", node.path),
        };
        let quad: [f64; 4] = entry_node.numbers()?;
        samples.push(GyroBiasSample {
            temperature_c: quad[0] as f32,
            bias: [quad[1], quad[2], quad[3]],
        });
    }
    for pair in samples.windows(2) {
        if pair[1].temperature_c < pair[0].temperature_c {
            return Err(Error::schema(
                node.path.clone(),
                format!(
                    "temperatures must be non-decreasing, got {} after {}",
                    pair[1].temperature_c, pair[0].temperature_c
                ),
            ));
        }
    }
    Ok(samples)
}

fn expect_fixed(node: &Node, expected: &[f64]) -> Result<()> {
    let got = node.number_vec()?;
    if got.len() != expected.len() {
        return Err(Error::schema(
            node.path.clone(),
            format!("expected {} elements, got {}", expected.len(), got.len()),
        ));
    }
    if got.iter().zip(expected).any(|(a, b)| a != b) {
        return Err(Error::schema(
            node.path.clone(),
            format!("expected fixed value {expected:?}, got {got:?}"),
        ));
    }
    Ok(())
}

fn integral_u32(v: f64) -> Option<u32> {
    if v.is_finite() && v >= 0.0 && v <= f64::from(u32::MAX) && v.fract() == 0.0 {
        Some(v as u32)
    } else {
        None
    }
}

/// One location in the JSON tree, carrying the path used in diagnostics.
struct Node<'a> {
    value: &'a Value,
    path: String,
}

impl<'a> Node<'a> {
    fn child(&self, key: &str) -> Result<Node<'a>> {
        match self.opt_child(key)? {
            Some(node) => Ok(node),
            None => Err(Error::schema(
                format!("{}.{key}", self.path),
                "missing required key",
            )),
        }
    }

    fn opt_child(&self, key: &str) -> Result<Option<Node<'a>>> {
        let object = self
            .value
            .as_object()
            .ok_or_else(|| Error::schema(self.path.clone(), "expected an object"))?;
        Ok(object.get(key).map(|value| Node {
            value,
            path: format!("{}.{key}", self.path),
        }))
    }

    fn string(&self) -> Result<String> {
        self.value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::schema(self.path.clone(), "expected a string"))
    }

    /// A finite JSON number.
    fn number(&self) -> Result<f64> {
        let v = self
            .value
            .as_f64()
            .ok_or_else(|| Error::schema(self.path.clone(), "expected a number"))?;
        if !v.is_finite() {
            return Err(Error::schema(self.path.clone(), "number is not finite"));
        }
        Ok(v)
    }

    /// A number whose double form is exactly integral.
    fn integer(&self) -> Result<i64> {
        let v = self.number()?;
        if v.fract() != 0.0 || v < i64::MIN as f64 || v > i64::MAX as f64 {
            return Err(Error::schema(
                self.path.clone(),
                format!("{v} is not an integer"),
            ));
        }
        Ok(v as i64)
    }

    fn unsigned(&self) -> Result<u32> {
        let v = self.integer()?;
        u32::try_from(v).map_err(|_| {
            Error::schema(self.path.clone(), format!("{v} is out of range for u32"))
        })
    }

    fn array(&self) -> Result<&'a [Value]> {
        self.value
            .as_array()
            .map(Vec::as_slice)
            .ok_or_else(|| Error::schema(self.path.clone(), "expected an array"))
    }

    /// Array of finite numbers, any length.
    fn number_vec(&self) -> Result<Vec<f64>> {
        let values = self.array()?;
        let mut out = Vec::with_capacity(values.len());
        for (i, v) in values.iter().enumerate() {
            let node = Node {
                value: v,
                path: format!("{}[{i}]", self.path),
            };
            out.push(node.number()?);
        }
        Ok(out)
    }

    /// Array of finite numbers with the exact arity `N`, checked length-first.
    fn numbers<const N: usize>(&self) -> Result<[f64; N]> {
        let values = self.array()?;
        if values.len() != N {
            return Err(Error::schema(
                self.path.clone(),
                format!("expected {N} elements, got {}", values.len()),
            ));
        }
        let mut out = [0.0; N];
        for (i, v) in values.iter().enumerate() {
            let node = Node {
                value: v,
                path: format!("{}[{i}]", self.path),
            };
            out[i] = node.number()?;
        }
        Ok(out)
    }
}
