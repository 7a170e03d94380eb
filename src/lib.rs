//! # xreal-one - Rust client SDK for XREAL One / One Pro smart glasses
//!
//! Talks to the glasses over their link-local network interface using two
//! TCP sessions. Provides:
//! - Real-time decoded IMU / magnetometer reports and a fused
//!   head-orientation stream suitable for driving a camera
//! - A synchronous request/response control channel (brightness, display
//!   modes, identity queries, calibration download)
//! - Stillness calibration with factory temperature-indexed bias correction,
//!   recentering, and optional 1-euro pose smoothing
//!
//! ## Quick Start
//! ```no_run
//! use xreal_one::{Client, ClientConfig};
//!
//! let client = Client::new(ClientConfig::default());
//! let tracking = client.subscribe_tracking();
//! let info = client.start().unwrap();
//! println!("connected to {}", info.fsn);
//! for _ in 0..100 {
//!     let sample = tracking.recv().unwrap();
//!     println!("pose: {:?}", sample.relative);
//! }
//! client.stop();
//! ```

pub mod client;
pub mod config;
mod control;
pub mod error;
pub mod filter;
pub mod framer;
pub mod net;
pub mod property;
pub mod protocol;
mod stream;
pub mod tracker;
pub mod types;
pub mod varint;
pub mod watch;

pub use client::{Client, ClientConfig};
pub use config::DeviceConfig;
pub use error::Error;
pub use filter::OneEuroConfig;
pub use framer::{FramerCounters, ReportFramer};
pub use net::NetOptions;
pub use types::*;

/// Result type alias for xreal-one operations.
pub type Result<T> = std::result::Result<T, Error>;
