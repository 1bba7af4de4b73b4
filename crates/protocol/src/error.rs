//! Protocol error types

use thiserror::Error;

/// Protocol-level errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Buffer too small to hold a packet header
    #[error("Buffer too small: needed {needed}, got {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// Top byte of the header is not the validity marker
    #[error("Invalid packet marker: {marker:#04x}")]
    InvalidMarker { marker: u8 },

    /// Frame dimensions that cannot be carved into whole payloads
    #[error("Invalid geometry {width}x{height}: {reason}")]
    InvalidGeometry {
        width: u32,
        height: u32,
        reason: &'static str,
    },

    /// Unknown numeric selector for a norm, input or scan type
    #[error("Invalid {kind} selection: {value}")]
    InvalidSelection { kind: &'static str, value: i32 },
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
