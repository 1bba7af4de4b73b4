//! Transport error types

use crate::usb::continuation::TransferId;
use nix::errno::Errno;
use thiserror::Error;

/// Errors reported to callers of the URB transport
///
/// Nothing on the reap path produces these; completions that go wrong are
/// recovered in place or end the transport (see [`super::UrbTransport::is_stopped`]).
#[derive(Debug, Error)]
pub enum TransportError {
    /// The kernel refused a URB
    #[error("URB submission failed: {0}")]
    Submit(Errno),

    /// A fatal completion or reap error stopped the transport
    #[error("transport stopped")]
    Stopped,

    #[error("async reap already running")]
    AlreadyRunning,

    #[error("isochronous transfers already initialised")]
    IsoActive,

    #[error("unknown transfer {0}")]
    UnknownTransfer(TransferId),

    #[error("invalid transfer parameters: {0}")]
    InvalidParams(&'static str),

    #[error("failed to spawn reap thread: {0}")]
    Spawn(#[from] std::io::Error),

    /// Synchronous bulk transfer failed
    #[error("bulk transfer on endpoint {endpoint:#04x} failed: {source}")]
    Bulk { endpoint: u8, source: Errno },

    /// Synchronous bulk write moved fewer bytes than asked
    #[error("bulk write on endpoint {endpoint:#04x} sent {sent} of {expected} bytes")]
    ShortWrite {
        endpoint: u8,
        sent: usize,
        expected: usize,
    },
}

/// A register write that the device rejected
#[derive(Debug, Error, PartialEq, Eq)]
#[error("register write {index:#06x} = {value:#06x} failed: {errno}")]
pub struct RegisterWriteError {
    pub index: u16,
    pub value: u16,
    pub errno: Errno,
}

pub type Result<T> = std::result::Result<T, TransportError>;
