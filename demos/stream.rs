//! Stream fused head orientation to stdout.
//!
//! Usage: cargo run --example stream [host]

use std::time::Duration;

use xreal_one::{Client, ClientConfig, NetOptions, PoseDataMode, SessionState};

fn main() {
    env_logger::init();

    let mut config = ClientConfig::default();
    if let Some(host) = std::env::args().nth(1) {
        config.net = NetOptions {
            host,
            ..NetOptions::default()
        };
    }

    let client = Client::new(config);
    let states = client.subscribe_session_state();
    let tracking = client.subscribe_tracking();
    let diagnostics = client.subscribe_diagnostics();

    let info = match client.start() {
        Ok(info) => info,
        Err(e) => {
            eprintln!("start failed: {e}");
            std::process::exit(1);
        }
    };
    println!("connected: FSN {} (v{})", info.fsn, info.glasses_version);
    client.set_pose_data_mode(PoseDataMode::Smooth);

    // Hold the glasses still until calibration finishes.
    loop {
        match states.recv() {
            Ok(SessionState::Calibrating { progress, target }) => {
                eprint!("\rcalibrating {progress}/{target}");
            }
            Ok(SessionState::Streaming) => {
                eprintln!("\rcalibration done        ");
                break;
            }
            Ok(SessionState::Error { error, .. }) => {
                eprintln!("\rsession error: {error}");
                std::process::exit(1);
            }
            Ok(_) => {}
            Err(_) => std::process::exit(1),
        }
    }

    let mut printed = 0u64;
    loop {
        crossbeam_channel::select! {
            recv(tracking) -> sample => {
                let Ok(sample) = sample else { break };
                printed += 1;
                if printed % 100 == 0 {
                    let r = sample.relative;
                    println!(
                        "pitch {:+8.2}  yaw {:+8.2}  roll {:+8.2}  (dt {:.4}s)",
                        r.pitch, r.yaw, r.roll, sample.delta_t
                    );
                }
            }
            recv(diagnostics) -> diag => {
                let Ok(diag) = diag else { break };
                eprintln!(
                    "[diag] {:.0} Hz, dropped {} bytes, recv delta avg {:.2} ms",
                    diag.observed_hz,
                    diag.counters.dropped_bytes,
                    diag.recv_delta_avg_s * 1e3
                );
            }
            default(Duration::from_secs(5)) => {
                eprintln!("no samples for 5 s, giving up");
                break;
            }
        }
    }
    client.stop();
}
