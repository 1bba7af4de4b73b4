//! usbtv007 capture core
//!
//! Streams video from a usbtv007 tuner through Linux usbfs. The [`usb`]
//! module owns the URB lifecycle and the reap thread; [`capture`] assembles
//! packets into frames and runs the session state machine; [`config`] loads
//! the TOML configuration used by the `usbtv-capture` binary.
//!
//! # Example
//!
//! ```no_run
//! use capture::capture::{CaptureSession, CapturedFrame, SessionParams};
//! use capture::usb::DeviceFile;
//! use std::sync::Arc;
//!
//! # fn main() -> anyhow::Result<()> {
//! let device = DeviceFile::open("/dev/bus/usb/001/004")?;
//! device.claim_interface(0)?;
//!
//! let consumer = |frame: CapturedFrame| {
//!     println!("frame {} ({:?})", frame.frame_id(), frame.state());
//! };
//! let mut session = CaptureSession::new(Arc::new(device), SessionParams::default(), consumer);
//! session.start()?;
//! std::thread::sleep(std::time::Duration::from_secs(1));
//! session.stop();
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod config;
pub mod usb;

pub use capture::{CaptureSession, CapturedFrame, SessionError, SessionParams, SessionState};
pub use config::CaptureConfig;
pub use usb::{TransportError, UrbTransport};
