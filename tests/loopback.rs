//! End-to-end exercise against an in-process fake device.
//!
//! Two loopback listeners stand in for the glasses: the control side answers
//! property transactions and pushes an unsolicited key event, the stream
//! side sends garbage-prefixed sensor reports at a steady device-time rate.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use xreal_one::protocol::{
    self, MAGIC_GET_CONFIG, MAGIC_GET_ID, MAGIC_GET_SOFTWARE_VERSION, MAGIC_KEY_STATE_CHANGE,
};
use xreal_one::varint;
use xreal_one::{
    Client, ClientConfig, ControlEvent, Error, KeyState, KeyType, NetOptions, ReportKind,
    SensorReport, SessionState,
};

const FSN: &str = "XR1PRO777";
const SOFTWARE_VERSION: &str = "11.2.0";

fn device_config_json() -> String {
    format!(
        r#"{{
  "glasses_version": 8,
  "FSN": "{FSN}",
  "last_modified_time": "2025-10-01 09:30:00",
  "target_type": "IMU",
  "display": {{
    "num_of_displays": 2,
    "left_display": {{
      "intrinsic": [520.0, 0.0, 320.0, 0.0, 520.0, 240.0, 0.0, 0.0, 1.0],
      "transform": [1.0, 0.0, 0.0, -0.032, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0]
    }},
    "right_display": {{
      "intrinsic": [520.0, 0.0, 320.0, 0.0, 520.0, 240.0, 0.0, 0.0, 1.0],
      "transform": [1.0, 0.0, 0.0, 0.032, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0]
    }}
  }},
  "display_distortion": {{
    "left_display": {{ "num_row": 1, "num_col": 1, "data": [0.5, 0.5, 0.5, 0.5] }},
    "right_display": {{ "num_row": 1, "num_col": 1, "data": [0.5, 0.5, 0.5, 0.5] }}
  }},
  "IMU": {{
    "device_1": {{
      "accel_bias": [0.0, 0.0, 0.0],
      "gyro_bias": [0.1, -0.1, 0.05],
      "gyro_bias_temp_data": [
        [20.0, 0.05, -0.05, 0.02],
        [40.0, 0.15, -0.15, 0.08]
      ],
      "magnetometer_transform": {{
        "rotation": [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
        "translation": [0.0, 0.0, 0.0]
      }},
      "accel_intrinsic": {{
        "peak_to_peak": [0.02, 0.02, 0.03],
        "std": [0.004, 0.004, 0.005],
        "bias": [0.001, -0.002, 0.003],
        "calibration_matrix": [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0]
      }},
      "gyro_intrinsic": {{
        "peak_to_peak": [0.02, 0.02, 0.03],
        "std": [0.004, 0.004, 0.005],
        "bias": [0.001, -0.002, 0.003],
        "calibration_matrix": [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0]
      }},
      "accel_q_gyro": [0.0, 0.0, 0.0, 1.0],
      "accel_p_gyro": [0.0, 0.0, 0.0],
      "scale_accel": [1.0, 1.0, 1.0],
      "scale_gyro": [1.0, 1.0, 1.0],
      "skew_accel": [0.0, 0.0, 0.0],
      "skew_gyro": [0.0, 0.0, 0.0],
      "static_detect_window": 100,
      "mean_temperature": 30.0,
      "noise": [0.01, 0.02, 0.03, 0.04]
    }}
  }}
}}"#
    )
}

fn string_response(s: &str) -> Vec<u8> {
    let mut inner = vec![0x12];
    inner.extend_from_slice(&varint::encode(s.len() as u64));
    inner.extend_from_slice(s.as_bytes());
    let mut body = vec![0x22];
    body.extend_from_slice(&varint::encode(inner.len() as u64));
    body.extend_from_slice(&inner);
    body
}

fn empty_response() -> Vec<u8> {
    vec![0x22, 0x00]
}

fn key_event_frame(key_type: u32, key_state: u32, device_time: u32) -> Vec<u8> {
    let mut payload = [0u8; 64];
    payload[0..4].copy_from_slice(&key_type.to_le_bytes());
    payload[4..8].copy_from_slice(&key_state.to_le_bytes());
    payload[8..12].copy_from_slice(&device_time.to_le_bytes());
    let mut frame = Vec::new();
    frame.extend_from_slice(&MAGIC_KEY_STATE_CHANGE.to_be_bytes());
    frame.extend_from_slice(&64u32.to_be_bytes());
    frame.extend_from_slice(&payload);
    frame
}

/// Answer control transactions until the client hangs up. Pushes one key
/// event right after serving the config, like real firmware does when a
/// button is held during connect.
fn run_control_device(listener: TcpListener, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::Acquire) {
        let Ok((mut socket, _)) = listener.accept() else {
            return;
        };
        loop {
            let mut header = [0u8; 6];
            if socket.read_exact(&mut header).is_err() {
                break;
            }
            let magic = u16::from_be_bytes([header[0], header[1]]);
            let len = u32::from_be_bytes(header[2..6].try_into().unwrap()) as usize;
            let mut body = vec![0u8; len];
            if socket.read_exact(&mut body).is_err() {
                break;
            }
            let payload = match magic {
                MAGIC_GET_CONFIG => string_response(&device_config_json()),
                MAGIC_GET_SOFTWARE_VERSION => string_response(SOFTWARE_VERSION),
                MAGIC_GET_ID => string_response("unit-0042"),
                _ => empty_response(),
            };
            let mut response = Vec::new();
            response.extend_from_slice(&magic.to_be_bytes());
            response.extend_from_slice(&((payload.len() + 4) as u32).to_be_bytes());
            response.extend_from_slice(&body[0..4]);
            response.extend_from_slice(&payload);
            if socket.write_all(&response).is_err() {
                break;
            }
            if magic == MAGIC_GET_CONFIG
                && socket.write_all(&key_event_frame(2, 1, 123_456)).is_err()
            {
                break;
            }
        }
    }
}

fn still_report(ts: u64) -> SensorReport {
    SensorReport {
        device_id: 42,
        hmd_time_ns: ts,
        kind: ReportKind::Imu,
        gyro: [0.0; 3],
        // Raw x carries gravity; the client remaps it onto the tracker's z.
        accel: [9.81, 0.0, 0.0],
        mag: [0.0; 3],
        temperature_c: 30.0,
        imu_id: 1,
        frame_id: [0, 0, 0],
    }
}

/// Stream reports at a 1 kHz device-time rate until the client disconnects.
fn run_stream_device(listener: TcpListener, stop: Arc<AtomicBool>) {
    let Ok((mut socket, _)) = listener.accept() else {
        return;
    };
    // A partial frame of garbage first: the framer must resynchronize.
    if socket.write_all(&[0x11, 0x22, 0x33]).is_err() {
        return;
    }
    let mut ts = 1_000u64;
    while !stop.load(Ordering::Acquire) {
        let mut batch = Vec::new();
        for _ in 0..10 {
            batch.extend_from_slice(&protocol::encode_report(&still_report(ts)));
            ts += 1_000_000;
        }
        if socket.write_all(&batch).is_err() {
            return;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

struct FakeDevice {
    options: NetOptions,
    stop: Arc<AtomicBool>,
    threads: Vec<std::thread::JoinHandle<()>>,
}

impl FakeDevice {
    fn start() -> FakeDevice {
        let control = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpListener::bind("127.0.0.1:0").unwrap();
        let options = NetOptions {
            host: "127.0.0.1".to_string(),
            control_port: control.local_addr().unwrap().port(),
            stream_port: stream.local_addr().unwrap().port(),
            connect_timeout: Duration::from_secs(1),
        };
        let stop = Arc::new(AtomicBool::new(false));
        let threads = vec![
            {
                let stop = stop.clone();
                std::thread::spawn(move || run_control_device(control, stop))
            },
            {
                let stop = stop.clone();
                std::thread::spawn(move || run_stream_device(stream, stop))
            },
        ];
        FakeDevice {
            options,
            stop,
            threads,
        }
    }

    fn shutdown(mut self) {
        self.stop.store(true, Ordering::Release);
        // Unblock a control accept() that never fired.
        let _ = TcpStream::connect(("127.0.0.1", self.options.control_port));
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

fn test_client(options: NetOptions) -> Client {
    Client::new(ClientConfig {
        net: options,
        calibration_target: 20,
        startup_timeout: Duration::from_secs(5),
        request_timeout: Duration::from_secs(2),
        ..ClientConfig::default()
    })
}

#[test]
fn full_session_lifecycle() {
    let device = FakeDevice::start();
    let client = test_client(device.options.clone());

    let states = client.subscribe_session_state();
    let tracking = client.subscribe_tracking();
    let reports = client.subscribe_reports();
    let control_events = client.subscribe_control_events();

    let info = client.start().expect("startup against fake device");
    assert_eq!(info.fsn, FSN);
    assert_eq!(info.glasses_version, 8);

    // States arrive in lifecycle order: Idle snapshot, Connecting, some
    // Calibrating progress, then Streaming.
    let timeout = Duration::from_secs(5);
    let mut saw_connecting = false;
    let mut saw_calibrating = false;
    loop {
        match states.recv_timeout(timeout).unwrap() {
            SessionState::Idle => {}
            SessionState::Connecting => saw_connecting = true,
            SessionState::Calibrating { target, .. } => {
                assert_eq!(target, 20);
                saw_calibrating = true;
            }
            SessionState::Streaming => break,
            other => panic!("unexpected state {other:?}"),
        }
    }
    assert!(saw_connecting && saw_calibrating);

    match client.bias_state() {
        xreal_one::BiasState::Active {
            fsn,
            glasses_version,
        } => {
            assert_eq!(fsn, FSN);
            assert_eq!(glasses_version, 8);
        }
        other => panic!("expected active bias, got {other:?}"),
    }

    // Raw reports and fused samples flow.
    let report = reports.recv_timeout(timeout).unwrap();
    assert_eq!(report.device_id, 42);
    let sample = tracking.recv_timeout(timeout).unwrap();
    assert!((sample.delta_t - 0.001).abs() < 1e-6);
    assert!(sample.absolute.yaw.abs() < 1.0);

    // The unsolicited key event pushed after config download.
    match control_events.recv_timeout(timeout).unwrap() {
        ControlEvent::Key(event) => {
            assert_eq!(event.key_type, KeyType::FrontRockerButton);
            assert_eq!(event.key_state, KeyState::Down);
            assert_eq!(event.device_time_ns, 123_456);
        }
        other => panic!("expected key event, got {other:?}"),
    }

    // Control RPCs share the session that loaded the config.
    assert_eq!(client.get_software_version().unwrap(), SOFTWARE_VERSION);
    assert_eq!(client.get_id().unwrap(), "unit-0042");
    client.set_brightness(5).unwrap();
    assert!(matches!(
        client.set_brightness(12),
        Err(Error::InvalidArgument(_))
    ));

    // Recentering while streaming.
    client.zero_view().unwrap();
    let recentered = tracking.recv_timeout(timeout).unwrap();
    assert!(recentered.relative.yaw.abs() < 1.0);

    client.stop();
    assert_eq!(client.session_state(), SessionState::Stopped);
    assert_eq!(client.bias_state(), xreal_one::BiasState::Inactive);
    assert!(matches!(client.zero_view(), Err(Error::ConnectionClosed)));

    device.shutdown();
}

#[test]
fn recalibrate_returns_to_calibrating() {
    let device = FakeDevice::start();
    let client = test_client(device.options.clone());

    client.start().unwrap();
    let states = client.subscribe_session_state();
    // Wait until streaming.
    let timeout = Duration::from_secs(5);
    loop {
        if states.recv_timeout(timeout).unwrap() == SessionState::Streaming {
            break;
        }
    }

    client.recalibrate().unwrap();
    let mut recalibrated = false;
    loop {
        match states.recv_timeout(timeout).unwrap() {
            SessionState::Calibrating { .. } => recalibrated = true,
            SessionState::Streaming if recalibrated => break,
            _ => {}
        }
    }

    client.stop();
    device.shutdown();
}

#[test]
fn start_fails_cleanly_when_no_device_listens() {
    let options = NetOptions {
        host: "127.0.0.1".to_string(),
        control_port: 1,
        stream_port: 1,
        connect_timeout: Duration::from_millis(200),
    };
    let client = test_client(options);
    let err = client.start().unwrap_err();
    assert!(matches!(err, Error::ConnectionFailed(_)));
    assert!(matches!(
        client.session_state(),
        SessionState::Error { .. } | SessionState::Stopped
    ));

    // A second attempt is allowed after the failure.
    let err = client.start().unwrap_err();
    assert!(matches!(err, Error::ConnectionFailed(_)));
}

#[test]
fn dropping_client_tears_down() {
    let device = FakeDevice::start();
    let client = test_client(device.options.clone());
    let states = client.subscribe_session_state();
    client.start().unwrap();
    drop(client);
    // The subscriber observes the stop-driven transition.
    let timeout = Duration::from_secs(5);
    loop {
        match states.recv_timeout(timeout) {
            Ok(SessionState::Stopped) => break,
            Ok(_) => {}
            Err(e) => panic!("never saw Stopped: {e}"),
        }
    }
    device.shutdown();
}
