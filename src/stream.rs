//! Stream-socket session: the read loop feeding framer, tracker and
//! publishers.
//!
//! A dedicated reader thread owns the socket and the tracker. Short read
//! timeouts are retried silently so the stop flag is observed even when the
//! device goes quiet; EOF and socket errors terminate the session through
//! the lifecycle channel. Tracker anomalies are fatal, per-report decode
//! anomalies are only counted.

use std::io::Read;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;

use crate::filter::{EulerSmoother, OneEuroConfig};
use crate::framer::ReportFramer;
use crate::tracker::{HeadTracker, TrackerSample, TrackerStep};
use crate::types::{Diagnostics, ReportKind, SensorReport, TrackingSample};
use crate::watch::EventBus;
use crate::Error;

const READ_TIMEOUT: Duration = Duration::from_millis(250);
const READ_BUF_LEN: usize = 4096;
/// Tracking samples per diagnostics snapshot.
const DIAGNOSTICS_WINDOW: u32 = 1000;

/// One-shot command flags consumed by the stream loop at the next sample.
#[derive(Debug, Default)]
pub(crate) struct StreamFlags {
    pub zero_view: AtomicBool,
    pub recalibrate: AtomicBool,
    /// Smooth (true) or raw (false) relative orientation on published samples.
    pub smooth: AtomicBool,
}

/// Lifecycle notifications consumed by the session supervisor.
#[derive(Debug)]
pub(crate) enum StreamEvent {
    FirstReport,
    Calibrating { samples: u32, target: u32 },
    CalibrationComplete,
    Terminated { error: Option<Error>, reason: &'static str },
}

pub(crate) struct StreamBuses {
    pub reports: Arc<EventBus<SensorReport>>,
    pub samples: Arc<EventBus<TrackingSample>>,
    pub diagnostics: Arc<EventBus<Diagnostics>>,
}

/// Handle to the running stream reader thread.
pub(crate) struct StreamTask {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl StreamTask {
    pub fn spawn(
        stream: TcpStream,
        tracker: HeadTracker,
        smoother_config: OneEuroConfig,
        buses: StreamBuses,
        lifecycle: Sender<StreamEvent>,
        flags: Arc<StreamFlags>,
        stop: Arc<AtomicBool>,
    ) -> crate::Result<StreamTask> {
        let stop_clone = stop.clone();
        let thread = std::thread::Builder::new()
            .name("xreal-stream".into())
            .spawn(move || {
                stream_reader_loop(
                    stream,
                    tracker,
                    smoother_config,
                    buses,
                    lifecycle,
                    flags,
                    stop_clone,
                )
            })
            .map_err(Error::io)?;
        Ok(StreamTask {
            stop,
            thread: Some(thread),
        })
    }

    /// Request termination and wait for the reader to finish.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for StreamTask {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Receive-interval statistics over one diagnostics window.
#[derive(Debug)]
struct RecvStats {
    window_start: Instant,
    last_sample: Option<Instant>,
    min_s: f64,
    max_s: f64,
    sum_s: f64,
    deltas: u32,
}

impl RecvStats {
    fn new() -> Self {
        Self {
            window_start: Instant::now(),
            last_sample: None,
            min_s: f64::INFINITY,
            max_s: 0.0,
            sum_s: 0.0,
            deltas: 0,
        }
    }

    fn record(&mut self, now: Instant) {
        if let Some(last) = self.last_sample {
            let delta = now.duration_since(last).as_secs_f64();
            self.min_s = self.min_s.min(delta);
            self.max_s = self.max_s.max(delta);
            self.sum_s += delta;
            self.deltas += 1;
        }
        self.last_sample = Some(now);
    }

    fn snapshot(&mut self, counters: crate::framer::FramerCounters, samples: u32) -> Diagnostics {
        let elapsed = self.window_start.elapsed().as_secs_f64();
        let diagnostics = Diagnostics {
            counters,
            observed_hz: if elapsed > 0.0 {
                f64::from(samples) / elapsed
            } else {
                0.0
            },
            recv_delta_min_s: if self.deltas > 0 { self.min_s } else { 0.0 },
            recv_delta_avg_s: if self.deltas > 0 {
                self.sum_s / f64::from(self.deltas)
            } else {
                0.0
            },
            recv_delta_max_s: self.max_s,
            window_samples: samples,
        };
        // Start a fresh window, keeping the last receive time so the first
        // delta of the next window is still meaningful.
        let last = self.last_sample;
        *self = RecvStats::new();
        self.last_sample = last;
        diagnostics
    }
}

fn stream_reader_loop(
    stream: TcpStream,
    mut tracker: HeadTracker,
    smoother_config: OneEuroConfig,
    buses: StreamBuses,
    lifecycle: Sender<StreamEvent>,
    flags: Arc<StreamFlags>,
    stop: Arc<AtomicBool>,
) {
    let mut stream = stream;
    if let Err(e) = stream.set_read_timeout(Some(READ_TIMEOUT)) {
        let _ = lifecycle.send(StreamEvent::Terminated {
            error: Some(Error::io(e)),
            reason: "socket setup",
        });
        return;
    }

    log::info!("stream reader started");
    let mut framer = ReportFramer::new();
    let mut smoother = EulerSmoother::new(smoother_config);
    let mut stats = RecvStats::new();
    let mut buf = [0u8; READ_BUF_LEN];
    let mut seen_first_report = false;
    let mut window_samples: u32 = 0;

    loop {
        if stop.load(Ordering::Acquire) {
            log::info!("stream reader stopping (stop flag set)");
            let _ = lifecycle.send(StreamEvent::Terminated {
                error: None,
                reason: "stopped",
            });
            return;
        }

        let n = match stream.read(&mut buf) {
            Ok(0) => {
                log::info!("stream socket reached EOF");
                let _ = lifecycle.send(StreamEvent::Terminated {
                    error: Some(Error::ConnectionClosed),
                    reason: "eof",
                });
                return;
            }
            Ok(n) => n,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                // No data is not termination.
                continue;
            }
            Err(e) => {
                if stop.load(Ordering::Acquire) {
                    let _ = lifecycle.send(StreamEvent::Terminated {
                        error: None,
                        reason: "stopped",
                    });
                } else {
                    let _ = lifecycle.send(StreamEvent::Terminated {
                        error: Some(Error::io(e)),
                        reason: "read",
                    });
                }
                return;
            }
        };

        let now = Instant::now();
        for report in framer.append(&buf[..n]) {
            if !seen_first_report {
                seen_first_report = true;
                let _ = lifecycle.send(StreamEvent::FirstReport);
            }
            buses.reports.publish(report);
            if report.kind != ReportKind::Imu {
                continue;
            }

            if flags.recalibrate.swap(false, Ordering::AcqRel) {
                log::info!("recalibration requested");
                tracker.reset();
                smoother.reset();
                let _ = lifecycle.send(StreamEvent::Calibrating {
                    samples: 0,
                    target: tracker.calibration_target(),
                });
            }
            if flags.zero_view.swap(false, Ordering::AcqRel) {
                tracker.zero_view();
                smoother.reset();
            }

            // Into the tracker's gravity frame; the factory accel bias was
            // remapped the same way when the bias table was built.
            let sample = TrackerSample {
                gyro: [
                    f64::from(report.gyro[0]),
                    f64::from(report.gyro[1]),
                    f64::from(report.gyro[2]),
                ],
                accel: [
                    f64::from(report.accel[2]),
                    f64::from(report.accel[1]),
                    f64::from(report.accel[0]),
                ],
                temperature_c: report.temperature_c,
                hmd_time_ns: report.hmd_time_ns,
            };

            match tracker.submit(&sample) {
                Ok(TrackerStep::Calibrating { samples, target }) => {
                    if samples == 1 || samples % 10 == 0 {
                        let _ = lifecycle.send(StreamEvent::Calibrating { samples, target });
                    }
                }
                Ok(TrackerStep::CalibrationComplete) => {
                    let _ = lifecycle.send(StreamEvent::CalibrationComplete);
                }
                Ok(TrackerStep::Primed) => {}
                Ok(TrackerStep::Updated(mut tracking)) => {
                    if flags.smooth.load(Ordering::Acquire) {
                        tracking.relative = smoother.filter(tracking.relative, tracking.delta_t);
                    } else {
                        smoother.reset();
                    }
                    buses.samples.publish(tracking);

                    stats.record(now);
                    window_samples += 1;
                    if window_samples >= DIAGNOSTICS_WINDOW {
                        let diagnostics = stats.snapshot(framer.counters(), window_samples);
                        buses.diagnostics.publish(diagnostics);
                        window_samples = 0;
                    }
                }
                Err(e) => {
                    log::warn!("tracker rejected sample: {e}");
                    let _ = lifecycle.send(StreamEvent::Terminated {
                        error: Some(e),
                        reason: "tracker",
                    });
                    return;
                }
            }
        }
    }
}
