//! The public client: session orchestration and one-shot device commands.
//!
//! One `Client` owns its whole universe: the state cells, the lazily opened
//! control session, and the streaming pipeline. `start()` runs the
//! connect → load-config → activate-bias → stream → calibrate sequence on a
//! background session thread and hands the caller a one-shot that resolves
//! with the device identity on the first parsed report.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::config::DeviceConfig;
use crate::control::ControlSession;
use crate::filter::OneEuroConfig;
use crate::net::{self, NetOptions};
use crate::property;
use crate::protocol::{
    MAGIC_GET_CONFIG, MAGIC_GET_DSP_VERSION, MAGIC_GET_ID, MAGIC_GET_SOFTWARE_VERSION,
    MAGIC_SET_BRIGHTNESS, MAGIC_SET_DIMMER, MAGIC_SET_DISPLAY_INPUT, MAGIC_SET_SCENE_MODE,
};
use crate::stream::{StreamBuses, StreamEvent, StreamFlags, StreamTask};
use crate::tracker::{BiasConfig, HeadTracker, TrackerConfig};
use crate::types::{
    BiasState, ConnectionInfo, ControlEvent, Diagnostics, PoseDataMode, SensorReport,
    SessionState, TrackingSample,
};
use crate::watch::{EventBus, StateCell};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub net: NetOptions,
    /// Stillness samples required before streaming begins.
    pub calibration_target: u32,
    /// Complementary-filter gyro weight.
    pub filter_alpha: f64,
    /// Per-axis scale on relative orientation.
    pub output_scale: [f64; 3],
    pub smoother: OneEuroConfig,
    /// Budget for `start()` to produce its first parsed report.
    pub startup_timeout: Duration,
    /// Budget for each control transaction.
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            net: NetOptions::default(),
            calibration_target: 500,
            filter_alpha: 0.98,
            output_scale: [1.0, 1.0, 1.0],
            smoother: OneEuroConfig::default(),
            startup_timeout: Duration::from_millis(3500),
            request_timeout: Duration::from_secs(2),
        }
    }
}

struct ActiveSession {
    stop: Arc<AtomicBool>,
    supervisor: Option<JoinHandle<()>>,
}

/// Client for one pair of XREAL One control/stream sessions.
pub struct Client {
    config: ClientConfig,
    session_state: Arc<StateCell<SessionState>>,
    bias_state: Arc<StateCell<BiasState>>,
    reports: Arc<EventBus<SensorReport>>,
    samples: Arc<EventBus<TrackingSample>>,
    diagnostics: Arc<EventBus<Diagnostics>>,
    control_events: Arc<EventBus<ControlEvent>>,
    control: Arc<Mutex<Option<Arc<ControlSession>>>>,
    active: Mutex<Option<ActiveSession>>,
    flags: Arc<StreamFlags>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            session_state: Arc::new(StateCell::new(SessionState::Idle)),
            bias_state: Arc::new(StateCell::new(BiasState::Inactive)),
            reports: Arc::new(EventBus::new()),
            samples: Arc::new(EventBus::new()),
            diagnostics: Arc::new(EventBus::new()),
            control_events: Arc::new(EventBus::new()),
            control: Arc::new(Mutex::new(None)),
            active: Mutex::new(None),
            flags: Arc::new(StreamFlags::default()),
        }
    }

    // -- Observables --

    pub fn session_state(&self) -> SessionState {
        self.session_state.get()
    }

    pub fn subscribe_session_state(&self) -> Receiver<SessionState> {
        self.session_state.subscribe()
    }

    pub fn bias_state(&self) -> BiasState {
        self.bias_state.get()
    }

    pub fn subscribe_bias_state(&self) -> Receiver<BiasState> {
        self.bias_state.subscribe()
    }

    pub fn subscribe_reports(&self) -> Receiver<SensorReport> {
        self.reports.subscribe()
    }

    pub fn subscribe_tracking(&self) -> Receiver<TrackingSample> {
        self.samples.subscribe()
    }

    pub fn subscribe_diagnostics(&self) -> Receiver<Diagnostics> {
        self.diagnostics.subscribe()
    }

    pub fn subscribe_control_events(&self) -> Receiver<ControlEvent> {
        self.control_events.subscribe()
    }

    // -- Lifecycle --

    /// Bring the full pipeline up. Blocks until the first report has been
    /// parsed (success) or the startup budget runs out.
    pub fn start(&self) -> Result<ConnectionInfo> {
        {
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(session) = active.as_mut() {
                // A session whose supervisor already exited (stream error)
                // only occupies the slot; reap it and start over.
                let finished = session
                    .supervisor
                    .as_ref()
                    .map_or(true, |handle| handle.is_finished());
                if !finished {
                    return Err(Error::InvalidArgument("session already started".into()));
                }
                if let Some(handle) = session.supervisor.take() {
                    let _ = handle.join();
                }
                *active = None;
            }

            self.session_state.set(SessionState::Connecting);
            self.bias_state.set(BiasState::LoadingConfig);

            let stop = Arc::new(AtomicBool::new(false));
            let (done_tx, done_rx) = bounded(1);
            let supervisor = self.spawn_session_thread(stop.clone(), done_tx)?;
            *active = Some(ActiveSession {
                stop,
                supervisor: Some(supervisor),
            });

            // Release the lock before waiting so stop() can interrupt a slow
            // startup.
            drop(active);

            match done_rx.recv_timeout(self.config.startup_timeout) {
                Ok(Ok(info)) => return Ok(info),
                Ok(Err(e)) => {
                    self.teardown(false);
                    return Err(e);
                }
                Err(RecvTimeoutError::Timeout) => {
                    log::warn!("startup exceeded its budget, tearing down");
                    self.teardown(false);
                    self.session_state.set(SessionState::Error {
                        error: Error::Timeout,
                        recoverable: true,
                    });
                    return Err(Error::Timeout);
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.teardown(false);
                    return Err(Error::ConnectionClosed);
                }
            }
        }
    }

    fn spawn_session_thread(
        &self,
        stop: Arc<AtomicBool>,
        done: Sender<Result<ConnectionInfo>>,
    ) -> Result<JoinHandle<()>> {
        let runner = SessionRunner {
            config: self.config.clone(),
            session_state: self.session_state.clone(),
            bias_state: self.bias_state.clone(),
            reports: self.reports.clone(),
            samples: self.samples.clone(),
            diagnostics: self.diagnostics.clone(),
            control_events: self.control_events.clone(),
            control: self.control.clone(),
            flags: self.flags.clone(),
            stop,
        };
        std::thread::Builder::new()
            .name("xreal-session".into())
            .spawn(move || runner.run(done))
            .map_err(Error::io)
    }

    /// Stop streaming, close the control session, fail all pending requests
    /// and reset the bias table.
    pub fn stop(&self) {
        self.teardown(true);
    }

    fn teardown(&self, mark_stopped: bool) {
        let session = {
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            active.take()
        };
        if let Some(mut session) = session {
            session.stop.store(true, Ordering::Release);
            // Closing the control session also unblocks a session thread
            // waiting on the get-config transaction.
            self.close_control();
            if let Some(handle) = session.supervisor.take() {
                let _ = handle.join();
            }
        } else {
            self.close_control();
        }
        self.bias_state.set(BiasState::Inactive);
        if mark_stopped {
            self.session_state.set(SessionState::Stopped);
        }
    }

    fn close_control(&self) {
        let session = {
            let mut control = self.control.lock().unwrap_or_else(|e| e.into_inner());
            control.take()
        };
        if let Some(session) = session {
            session.close();
        }
    }

    /// Recenter: the orientation at the next sample becomes the identity.
    pub fn zero_view(&self) -> Result<()> {
        self.require_streaming()?;
        self.flags.zero_view.store(true, Ordering::Release);
        Ok(())
    }

    /// Restart stillness calibration from scratch.
    pub fn recalibrate(&self) -> Result<()> {
        self.require_streaming()?;
        self.flags.recalibrate.store(true, Ordering::Release);
        Ok(())
    }

    fn require_streaming(&self) -> Result<()> {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        let running = matches!(
            active.as_ref(),
            Some(session) if !session.stop.load(Ordering::Acquire)
        );
        let state_ok = matches!(
            self.session_state.get(),
            SessionState::Calibrating { .. } | SessionState::Streaming
        );
        if running && state_ok {
            Ok(())
        } else {
            Err(Error::ConnectionClosed)
        }
    }

    /// Choose between raw and 1-euro-smoothed relative orientation.
    pub fn set_pose_data_mode(&self, mode: PoseDataMode) {
        self.flags
            .smooth
            .store(mode == PoseDataMode::Smooth, Ordering::Release);
    }

    // -- One-shot device commands --

    pub fn set_scene_mode(&self, mode: i32) -> Result<()> {
        self.set_numeric(MAGIC_SET_SCENE_MODE, mode)
    }

    pub fn set_display_input_mode(&self, mode: i32) -> Result<()> {
        self.set_numeric(MAGIC_SET_DISPLAY_INPUT, mode)
    }

    pub fn set_brightness(&self, level: i32) -> Result<()> {
        if !(0..=9).contains(&level) {
            return Err(Error::InvalidArgument(format!(
                "brightness must be in 0..=9, got {level}"
            )));
        }
        self.set_numeric(MAGIC_SET_BRIGHTNESS, level)
    }

    pub fn set_dimmer(&self, value: i32) -> Result<()> {
        self.set_numeric(MAGIC_SET_DIMMER, value)
    }

    pub fn get_id(&self) -> Result<String> {
        self.get_string(MAGIC_GET_ID)
    }

    pub fn get_software_version(&self) -> Result<String> {
        self.get_string(MAGIC_GET_SOFTWARE_VERSION)
    }

    pub fn get_dsp_version(&self) -> Result<String> {
        self.get_string(MAGIC_GET_DSP_VERSION)
    }

    /// Fetch the calibration payload without validating it.
    pub fn get_config_raw(&self) -> Result<String> {
        self.get_string(MAGIC_GET_CONFIG)
    }

    /// Fetch and validate the calibration payload.
    pub fn get_config(&self) -> Result<DeviceConfig> {
        DeviceConfig::parse(&self.get_config_raw()?)
    }

    fn set_numeric(&self, magic: u16, value: i32) -> Result<()> {
        let body = property::set_numeric_request(value)?;
        let session = self.control_session()?;
        let response = session.send_transaction(magic, &body, self.config.request_timeout)?;
        property::parse_empty_response(&response)
    }

    fn get_string(&self, magic: u16) -> Result<String> {
        let session = self.control_session()?;
        let response =
            session.send_transaction(magic, &property::get_request(), self.config.request_timeout)?;
        property::parse_string_response(&response)
    }

    /// Reuse the control session while it is healthy, reconnect otherwise.
    fn control_session(&self) -> Result<Arc<ControlSession>> {
        control_session(
            &self.control,
            &self.config.net,
            &self.control_events,
        )
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.teardown(true);
    }
}

fn control_session(
    slot: &Mutex<Option<Arc<ControlSession>>>,
    net: &NetOptions,
    events: &Arc<EventBus<ControlEvent>>,
) -> Result<Arc<ControlSession>> {
    let mut guard = slot.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(session) = guard.as_ref() {
        if session.is_healthy() {
            return Ok(session.clone());
        }
        log::info!("control session unhealthy, reconnecting");
    }
    let stream = net::connect(net, net.control_port)?;
    let session = Arc::new(ControlSession::open(stream, events.clone())?);
    *guard = Some(session.clone());
    Ok(session)
}

/// Everything the background session thread needs, detached from `&Client`.
struct SessionRunner {
    config: ClientConfig,
    session_state: Arc<StateCell<SessionState>>,
    bias_state: Arc<StateCell<BiasState>>,
    reports: Arc<EventBus<SensorReport>>,
    samples: Arc<EventBus<TrackingSample>>,
    diagnostics: Arc<EventBus<Diagnostics>>,
    control_events: Arc<EventBus<ControlEvent>>,
    control: Arc<Mutex<Option<Arc<ControlSession>>>>,
    flags: Arc<StreamFlags>,
    stop: Arc<AtomicBool>,
}

impl SessionRunner {
    fn run(self, done: Sender<Result<ConnectionInfo>>) {
        let mut done = Some(done);
        match self.run_inner(&mut done) {
            Ok(()) => {}
            Err(e) => {
                log::warn!("session failed: {e}");
                if !self.stop.load(Ordering::Acquire) {
                    self.session_state.set(SessionState::Error {
                        recoverable: e.is_recoverable(),
                        error: e.clone(),
                    });
                }
                if let Some(done) = done.take() {
                    let _ = done.send(Err(e));
                }
            }
        }
    }

    fn run_inner(&self, done: &mut Option<Sender<Result<ConnectionInfo>>>) -> Result<()> {
        // 1. Load and validate the device configuration over control.
        let control = control_session(&self.control, &self.config.net, &self.control_events)?;
        let raw_config = {
            let response = control.send_transaction(
                MAGIC_GET_CONFIG,
                &property::get_request(),
                self.config.request_timeout,
            )?;
            property::parse_string_response(&response)?
        };
        let device_config = match DeviceConfig::parse(&raw_config) {
            Ok(config) => config,
            Err(e) => {
                self.bias_state.set(BiasState::Error { error: e.clone() });
                return Err(e);
            }
        };

        // 2. Activate the bias table. The factory accel bias goes through the
        // same (az, ay, ax) remap the stream applies to accel samples, so the
        // subtraction happens in a consistent frame.
        let accel_bias = device_config.imu.accel_bias;
        let bias = BiasConfig {
            accel_bias: [accel_bias[2], accel_bias[1], accel_bias[0]],
            gyro_temp_curve: device_config.imu.gyro_bias_temp_data.clone(),
        };
        let info = ConnectionInfo {
            fsn: device_config.fsn.clone(),
            glasses_version: device_config.glasses_version,
        };
        self.bias_state.set(BiasState::Active {
            fsn: device_config.fsn.clone(),
            glasses_version: device_config.glasses_version,
        });

        if self.stop.load(Ordering::Acquire) {
            return Err(Error::ConnectionClosed);
        }

        // 3. Open the stream socket and launch the fuse pipeline.
        let stream_socket = net::connect(&self.config.net, self.config.net.stream_port)?;
        let tracker = HeadTracker::new(TrackerConfig {
            calibration_target: self.config.calibration_target,
            alpha: self.config.filter_alpha,
            output_scale: self.config.output_scale,
            bias,
        });
        let (lifecycle_tx, lifecycle_rx) = bounded(64);
        let buses = StreamBuses {
            reports: self.reports.clone(),
            samples: self.samples.clone(),
            diagnostics: self.diagnostics.clone(),
        };
        let mut stream_task = StreamTask::spawn(
            stream_socket,
            tracker,
            self.config.smoother,
            buses,
            lifecycle_tx,
            self.flags.clone(),
            self.stop.clone(),
        )?;

        self.session_state.set(SessionState::Calibrating {
            progress: 0,
            target: self.config.calibration_target,
        });

        // 4. Supervise the stream until it terminates.
        let outcome = self.supervise(&lifecycle_rx, done, &info);
        stream_task.stop();
        outcome
    }

    fn supervise(
        &self,
        lifecycle: &Receiver<StreamEvent>,
        done: &mut Option<Sender<Result<ConnectionInfo>>>,
        info: &ConnectionInfo,
    ) -> Result<()> {
        loop {
            let event = match lifecycle.recv() {
                Ok(event) => event,
                // The stream thread is gone without a terminal event; treat
                // it as a closed session.
                Err(_) => return Err(Error::ConnectionClosed),
            };
            match event {
                StreamEvent::FirstReport => {
                    if let Some(done) = done.take() {
                        let _ = done.send(Ok(info.clone()));
                    }
                }
                StreamEvent::Calibrating { samples, target } => {
                    self.session_state.set(SessionState::Calibrating {
                        progress: samples,
                        target,
                    });
                }
                StreamEvent::CalibrationComplete => {
                    log::info!("calibration complete, streaming");
                    self.session_state.set(SessionState::Streaming);
                }
                StreamEvent::Terminated { error, reason } => {
                    log::info!("stream terminated ({reason})");
                    match error {
                        // Requested stop: teardown publishes Stopped.
                        None => {}
                        // Stream errors are fully surfaced here; the bias
                        // table survives them, unlike a stop().
                        Some(e) => {
                            if !self.stop.load(Ordering::Acquire) {
                                self.session_state.set(SessionState::Error {
                                    recoverable: e.is_recoverable(),
                                    error: e.clone(),
                                });
                                self.session_state.set(SessionState::Stopped);
                            }
                            if let Some(done) = done.take() {
                                let _ = done.send(Err(e));
                            }
                        }
                    }
                    return Ok(());
                }
            }
        }
    }
}
