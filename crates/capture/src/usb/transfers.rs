//! Status classification and synchronous transfers
//!
//! Maps kernel status codes onto the recovery the transport applies, and
//! implements the blocking helpers used outside the streaming path: chunked
//! bulk reads and writes, and register programming over vendor control
//! transfers.

use crate::usb::error::{RegisterWriteError, Result, TransportError};
use crate::usb::usbfs::{ControlSetup, MAX_TRANSFER, TransferBuffer, UsbFs};
use nix::errno::Errno;
use protocol::RegisterWrite;
use protocol::registers::{REGISTER_REQUEST_TYPE, USBTV_REQUEST_REG};
use tracing::{debug, warn};

/// Times a failing bulk read chunk is retried before giving up
pub const BULK_READ_RETRIES: usize = 5;

/// What to do with a completed URB, derived from its status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrbStatus {
    /// Completed; iso transfers with some bad packets land here too
    Success,
    /// Device sent less than asked for
    Short,
    /// Endpoint halted, clear it before resubmitting
    Stall,
    /// We discarded it
    Cancelled,
    /// Device gone or host shutting down
    Fatal,
    /// Anything else: resubmit and carry on
    Transient,
}

/// Classify a completed URB's `status` field
pub fn classify_status(status: i32) -> UrbStatus {
    if status == 0 {
        return UrbStatus::Success;
    }
    match Errno::from_raw(-status) {
        Errno::EXDEV => UrbStatus::Success,
        Errno::EREMOTEIO => UrbStatus::Short,
        Errno::EPIPE => UrbStatus::Stall,
        Errno::ENOENT | Errno::ECONNRESET => UrbStatus::Cancelled,
        Errno::ENODEV | Errno::ESHUTDOWN => UrbStatus::Fatal,
        _ => UrbStatus::Transient,
    }
}

/// How the reap loop reacts to a failed reap call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapError {
    /// Nothing ready, or interrupted
    Transient,
    /// The device is gone; stop the transport
    Fatal,
    /// Unexpected; log and keep going
    Other,
}

/// Classify the errno of a failed reap ioctl
pub fn classify_reap_errno(errno: Errno) -> ReapError {
    match errno {
        Errno::EAGAIN | Errno::EINTR => ReapError::Transient,
        Errno::ENODEV | Errno::ENOENT | Errno::ECONNRESET | Errno::ESHUTDOWN => ReapError::Fatal,
        _ => ReapError::Other,
    }
}

/// Number of URBs a bulk buffer needs without scatter-gather
pub fn continuation_count(buffer_size: usize) -> usize {
    buffer_size.div_ceil(MAX_TRANSFER).max(1)
}

/// Read up to `buf.len()` bytes from a bulk IN endpoint
///
/// The read is split into [`MAX_TRANSFER`] chunks. A chunk that errors is
/// retried up to [`BULK_READ_RETRIES`] times; a short chunk ends the read.
/// Returns the number of bytes read.
pub fn bulk_read(fs: &dyn UsbFs, endpoint: u8, buf: &mut [u8], timeout_ms: u32) -> Result<usize> {
    if endpoint & 0x7f == 0 {
        return Err(TransportError::InvalidParams("endpoint 0 cannot carry bulk transfers"));
    }

    let mut count = 0;
    while count < buf.len() {
        let want = (buf.len() - count).min(MAX_TRANSFER);
        let chunk = &mut buf[count..count + want];

        let mut attempt = 0;
        let got = loop {
            match fs.bulk_transfer(endpoint, TransferBuffer::In(&mut *chunk), timeout_ms) {
                Ok(n) => break n,
                Err(e) => {
                    attempt += 1;
                    if attempt > BULK_READ_RETRIES {
                        warn!("Bulk read on {:#04x} exceeded {} retries", endpoint, BULK_READ_RETRIES);
                        return Err(TransportError::Bulk {
                            endpoint,
                            source: e,
                        });
                    }
                    debug!("Bulk read on {:#04x} failed ({}), retrying", endpoint, e);
                }
            }
        };

        count += got;
        if got < want {
            break;
        }
    }
    Ok(count)
}

/// Write `data` to a bulk OUT endpoint
///
/// An empty `data` sends a single zero-length packet. Every chunk must be
/// accepted in full.
pub fn bulk_write(fs: &dyn UsbFs, endpoint: u8, data: &[u8], timeout_ms: u32) -> Result<usize> {
    if endpoint & 0x7f == 0 {
        return Err(TransportError::InvalidParams("endpoint 0 cannot carry bulk transfers"));
    }

    if data.is_empty() {
        fs.bulk_transfer(endpoint, TransferBuffer::Out(&[]), timeout_ms)
            .map_err(|source| TransportError::Bulk { endpoint, source })?;
        return Ok(0);
    }

    for chunk in data.chunks(MAX_TRANSFER) {
        let sent = fs
            .bulk_transfer(endpoint, TransferBuffer::Out(chunk), timeout_ms)
            .map_err(|source| TransportError::Bulk { endpoint, source })?;
        if sent != chunk.len() {
            return Err(TransportError::ShortWrite {
                endpoint,
                sent,
                expected: chunk.len(),
            });
        }
    }
    Ok(data.len())
}

/// Program a list of registers, one vendor control transfer per pair
///
/// Stops at the first rejected write.
pub fn write_registers(
    fs: &dyn UsbFs,
    registers: &[RegisterWrite],
) -> std::result::Result<(), RegisterWriteError> {
    for &(index, value) in registers {
        let setup = ControlSetup {
            request_type: REGISTER_REQUEST_TYPE,
            request: USBTV_REQUEST_REG,
            value,
            index,
        };
        fs.control_transfer(setup, TransferBuffer::Out(&[]), 0)
            .map_err(|errno| RegisterWriteError {
                index,
                value,
                errno,
            })?;
    }
    debug!("Programmed {} registers", registers.len());
    Ok(())
}
