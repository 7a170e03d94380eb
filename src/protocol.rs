//! Wire-level constants and pure codecs for both device sockets.
//!
//! The stream socket carries self-delimited sensor reports; the control
//! socket carries length-prefixed command frames correlated by transaction
//! id. Everything here is side-effect free so it can be tested against byte
//! fixtures.

use crate::types::{KeyEvent, KeyState, KeyType, ReportKind, SensorReport};
use crate::{Error, Result};

// -- Default endpoints --
pub const DEFAULT_HOST: &str = "169.254.2.1";
pub const DEFAULT_CONTROL_PORT: u16 = 52999;
pub const DEFAULT_STREAM_PORT: u16 = 52998;

// -- Control command magics --
pub const MAGIC_SET_SCENE_MODE: u16 = 0x2829;
pub const MAGIC_SET_DISPLAY_INPUT: u16 = 0x2822;
pub const MAGIC_SET_BRIGHTNESS: u16 = 0x271c;
pub const MAGIC_SET_DIMMER: u16 = 0x2727;
pub const MAGIC_GET_CONFIG: u16 = 0x271f;
pub const MAGIC_GET_SOFTWARE_VERSION: u16 = 0x271d;
pub const MAGIC_GET_DSP_VERSION: u16 = 0x272d;
pub const MAGIC_GET_ID: u16 = 0x2729;
pub const MAGIC_KEY_STATE_CHANGE: u16 = 0x272e;

// -- Control frame geometry --
pub const CONTROL_HEADER_LEN: usize = 6;
/// Frames claiming more than this are treated as framing corruption.
pub const MAX_CONTROL_BODY_LEN: usize = 1 << 20;
const TX_ID_OUTBOUND_BIT: u32 = 0x8000_0000;

// -- Report stream geometry --
pub const REPORT_MAGIC0_PRIMARY: u8 = 0x28;
pub const REPORT_MAGIC0_ALTERNATE: u8 = 0x27;
pub const REPORT_MAGIC1: u8 = 0x36;
pub const REPORT_HEADER_LEN: usize = 6;
pub const REPORT_BODY_LEN: usize = 128;

const REPORT_KIND_IMU: u32 = 0x0b;
const REPORT_KIND_MAG: u32 = 0x04;
const KEY_EVENT_PAYLOAD_LEN: usize = 64;

/// Whether two consecutive bytes form a report header magic pair.
pub fn is_report_magic(b0: u8, b1: u8) -> bool {
    (b0 == REPORT_MAGIC0_PRIMARY || b0 == REPORT_MAGIC0_ALTERNATE) && b1 == REPORT_MAGIC1
}

/// Outcome of decoding one report body.
///
/// An unrecognized kind is not corruption; the 128 bytes are consumed and
/// the stream keeps going.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedReport {
    Report(SensorReport),
    UnknownKind(u32),
}

/// Decode a 128-byte report body.
///
/// Body layout (little-endian):
/// - `+0x00`: u64 device id
/// - `+0x08`: u64 device timestamp (ns)
/// - `+0x18`: u32 report kind (0x0B IMU, 0x04 magnetometer)
/// - `+0x1c`: nine f32 `gx gy gz ax ay az mx my mz`
/// - `+0x40`: f32 temperature (°C)
/// - `+0x44`: u8 IMU id
/// - `+0x45`: u8[3] 24-bit frame counter
pub fn decode_report_body(body: &[u8]) -> Result<DecodedReport> {
    if body.len() != REPORT_BODY_LEN {
        return Err(Error::protocol(format!(
            "report body must be {REPORT_BODY_LEN} bytes, got {}",
            body.len()
        )));
    }
    let u64_at = |off: usize| u64::from_le_bytes(body[off..off + 8].try_into().unwrap());
    let u32_at = |off: usize| u32::from_le_bytes(body[off..off + 4].try_into().unwrap());
    let f32_at = |off: usize| f32::from_le_bytes(body[off..off + 4].try_into().unwrap());

    let kind_wire = u32_at(0x18);
    let kind = match kind_wire {
        REPORT_KIND_IMU => ReportKind::Imu,
        REPORT_KIND_MAG => ReportKind::Magnetometer,
        other => return Ok(DecodedReport::UnknownKind(other)),
    };

    Ok(DecodedReport::Report(SensorReport {
        device_id: u64_at(0x00),
        hmd_time_ns: u64_at(0x08),
        kind,
        gyro: [f32_at(0x1c), f32_at(0x20), f32_at(0x24)],
        accel: [f32_at(0x28), f32_at(0x2c), f32_at(0x30)],
        mag: [f32_at(0x34), f32_at(0x38), f32_at(0x3c)],
        temperature_c: f32_at(0x40),
        imu_id: body[0x44],
        frame_id: [body[0x45], body[0x46], body[0x47]],
    }))
}

/// Encode a report as `header + body`, the device's stream framing.
pub fn encode_report(report: &SensorReport) -> Vec<u8> {
    let mut out = vec![0u8; REPORT_HEADER_LEN + REPORT_BODY_LEN];
    out[0] = REPORT_MAGIC0_PRIMARY;
    out[1] = REPORT_MAGIC1;
    out[2..6].copy_from_slice(&(REPORT_BODY_LEN as u32).to_be_bytes());

    let body = &mut out[REPORT_HEADER_LEN..];
    body[0x00..0x08].copy_from_slice(&report.device_id.to_le_bytes());
    body[0x08..0x10].copy_from_slice(&report.hmd_time_ns.to_le_bytes());
    let kind_wire = match report.kind {
        ReportKind::Imu => REPORT_KIND_IMU,
        ReportKind::Magnetometer => REPORT_KIND_MAG,
    };
    body[0x18..0x1c].copy_from_slice(&kind_wire.to_le_bytes());
    for (i, v) in report
        .gyro
        .iter()
        .chain(&report.accel)
        .chain(&report.mag)
        .enumerate()
    {
        let off = 0x1c + 4 * i;
        body[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }
    body[0x40..0x44].copy_from_slice(&report.temperature_c.to_le_bytes());
    body[0x44] = report.imu_id;
    body[0x45..0x48].copy_from_slice(&report.frame_id);
    out
}

/// Control frame header: `magic u16 BE | length u32 BE`.
pub fn encode_control_header(magic: u16, length: u32) -> [u8; CONTROL_HEADER_LEN] {
    let mut out = [0u8; CONTROL_HEADER_LEN];
    out[0..2].copy_from_slice(&magic.to_be_bytes());
    out[2..6].copy_from_slice(&length.to_be_bytes());
    out
}

/// Transaction id as it appears on the wire for outbound frames: high bit set.
pub fn mark_outbound(tx_id: u32) -> i32 {
    (tx_id | TX_ID_OUTBOUND_BIT) as i32
}

/// Strip the outbound marker; inbound ids without it pass through unchanged.
pub fn normalize_tx_id(wire: i32) -> u32 {
    (wire as u32) & !TX_ID_OUTBOUND_BIT
}

/// Decode a key-state-change payload: 64 bytes, three little-endian u32s at
/// offsets 0, 4 and 8 (key type, key state, device time).
pub fn decode_key_event(payload: &[u8]) -> Result<KeyEvent> {
    if payload.len() != KEY_EVENT_PAYLOAD_LEN {
        return Err(Error::protocol(format!(
            "key-state payload must be {KEY_EVENT_PAYLOAD_LEN} bytes, got {}",
            payload.len()
        )));
    }
    let u32_at = |off: usize| u32::from_le_bytes(payload[off..off + 4].try_into().unwrap());

    let key_type = match u32_at(0) {
        1 => KeyType::FrontTopBottomSingle,
        2 => KeyType::FrontRockerButton,
        3 => KeyType::BottomSingle,
        4 => KeyType::TopSingle,
        other => return Err(Error::protocol(format!("unknown key type {other}"))),
    };
    let key_state = match u32_at(4) {
        1 => KeyState::Down,
        2 => KeyState::Up,
        other => return Err(Error::protocol(format!("unknown key state {other}"))),
    };
    Ok(KeyEvent {
        key_type,
        key_state,
        device_time_ns: u64::from(u32_at(8)),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_report() -> SensorReport {
        SensorReport {
            device_id: 0x0102_0304_0506_0708,
            hmd_time_ns: 987_654_321_000,
            kind: ReportKind::Imu,
            gyro: [0.5, -1.25, 3.0],
            accel: [0.0, 9.81, -0.5],
            mag: [12.0, -7.5, 3.25],
            temperature_c: 36.5,
            imu_id: 2,
            frame_id: [0xaa, 0xbb, 0xcc],
        }
    }

    #[test]
    fn report_round_trip() {
        let report = sample_report();
        let bytes = encode_report(&report);
        assert_eq!(bytes.len(), REPORT_HEADER_LEN + REPORT_BODY_LEN);
        assert!(is_report_magic(bytes[0], bytes[1]));
        match decode_report_body(&bytes[REPORT_HEADER_LEN..]).unwrap() {
            DecodedReport::Report(decoded) => assert_eq!(decoded, report),
            other => panic!("expected report, got {other:?}"),
        }
    }

    #[test]
    fn magnetometer_round_trip() {
        let report = SensorReport {
            kind: ReportKind::Magnetometer,
            ..sample_report()
        };
        let bytes = encode_report(&report);
        match decode_report_body(&bytes[REPORT_HEADER_LEN..]).unwrap() {
            DecodedReport::Report(decoded) => assert_eq!(decoded, report),
            other => panic!("expected report, got {other:?}"),
        }
    }

    #[test]
    fn unknown_kind_is_classified() {
        let mut bytes = encode_report(&sample_report());
        bytes[REPORT_HEADER_LEN + 0x18..REPORT_HEADER_LEN + 0x1c]
            .copy_from_slice(&0x99u32.to_le_bytes());
        assert_eq!(
            decode_report_body(&bytes[REPORT_HEADER_LEN..]).unwrap(),
            DecodedReport::UnknownKind(0x99)
        );
    }

    #[test]
    fn short_body_is_protocol_error() {
        assert!(matches!(
            decode_report_body(&[0u8; 64]),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn magic_constants() {
        assert_eq!(MAGIC_SET_SCENE_MODE, 0x2829);
        assert_eq!(MAGIC_SET_DISPLAY_INPUT, 0x2822);
        assert_eq!(MAGIC_SET_BRIGHTNESS, 0x271c);
        assert_eq!(MAGIC_SET_DIMMER, 0x2727);
        assert_eq!(MAGIC_GET_CONFIG, 0x271f);
        assert_eq!(MAGIC_GET_SOFTWARE_VERSION, 0x271d);
        assert_eq!(MAGIC_GET_DSP_VERSION, 0x272d);
        assert_eq!(MAGIC_GET_ID, 0x2729);
        assert_eq!(MAGIC_KEY_STATE_CHANGE, 0x272e);
    }

    #[test]
    fn outbound_tx_marking() {
        for tx in [1u32, 2, 12345, i32::MAX as u32] {
            let wire = mark_outbound(tx);
            assert!(wire < 0, "outbound id must be negative as signed, tx={tx}");
            assert_eq!(normalize_tx_id(wire), tx);
            assert_eq!(normalize_tx_id(tx as i32), tx);
        }
    }

    #[test]
    fn control_header_layout() {
        let header = encode_control_header(0x271c, 9);
        assert_eq!(header, [0x27, 0x1c, 0x00, 0x00, 0x00, 0x09]);
    }

    #[test]
    fn key_event_decode() {
        let mut payload = [0u8; 64];
        payload[0..4].copy_from_slice(&2u32.to_le_bytes());
        payload[4..8].copy_from_slice(&1u32.to_le_bytes());
        payload[8..12].copy_from_slice(&1_234_567_890u32.to_le_bytes());
        let event = decode_key_event(&payload).unwrap();
        assert_eq!(event.key_type, KeyType::FrontRockerButton);
        assert_eq!(event.key_state, KeyState::Down);
        assert_eq!(event.device_time_ns, 1_234_567_890);
    }

    #[test]
    fn key_event_rejects_bad_length_and_enums() {
        assert!(matches!(
            decode_key_event(&[0u8; 63]),
            Err(Error::Protocol(_))
        ));
        let mut payload = [0u8; 64];
        payload[0..4].copy_from_slice(&9u32.to_le_bytes());
        payload[4..8].copy_from_slice(&1u32.to_le_bytes());
        assert!(matches!(decode_key_event(&payload), Err(Error::Protocol(_))));
        payload[0..4].copy_from_slice(&1u32.to_le_bytes());
        payload[4..8].copy_from_slice(&7u32.to_le_bytes());
        assert!(matches!(decode_key_event(&payload), Err(Error::Protocol(_))));
    }
}
