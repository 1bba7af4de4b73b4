//! USB handling over Linux usbfs
//!
//! This module talks to the tuner through raw usbfs ioctls rather than a
//! USB library:
//! - [`usbfs`]: the ioctl boundary and the [`UsbFs`] trait
//! - [`transport`]: asynchronous URB queueing and the reap thread
//! - [`continuation`]: bulk transfers split into chained URBs
//! - [`transfers`]: status classification and synchronous helpers
//! - `mock`: an in-process device for tests (`test-utils` feature)

pub mod continuation;
pub mod error;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
pub mod transfers;
pub mod transport;
pub mod urb;
pub mod usbfs;
mod worker;

pub use continuation::{BulkCallback, BulkCompletion, TransferControl, TransferId};
pub use error::{RegisterWriteError, TransportError};
pub use transfers::{bulk_read, bulk_write, write_registers};
pub use transport::{IsoCallback, IsoConfig, UrbTransport};
pub use urb::{IsoPacket, IsoTransfer};
pub use usbfs::{ControlSetup, DeviceFile, TransferBuffer, UsbFs};
