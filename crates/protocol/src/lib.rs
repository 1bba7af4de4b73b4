//! Protocol library for usbtv-capture
//!
//! This crate holds everything about the usbtv007 video stream that does not
//! touch a file descriptor: the 4-byte packet header, field geometry and the
//! sequence-number-to-offset arithmetic for each scan policy, the register
//! programs that select norm and input, and the selection enums shared by the
//! configuration and the capture session.
//!
//! # Example
//!
//! ```
//! use protocol::{FieldGeometry, PacketHeader, ScanType, TvNorm};
//!
//! let geometry = FieldGeometry::for_norm(TvNorm::Ntsc, ScanType::Progressive).unwrap();
//! assert_eq!(geometry.packets_per_field, 360);
//!
//! let header = PacketHeader::decode(&[0x88, 0x05, 0x80, 0x00]).unwrap();
//! assert_eq!(header.frame_id, 5);
//! assert!(header.odd_field);
//! assert_eq!(header.sequence, 0);
//! ```

pub mod error;
pub mod geometry;
pub mod header;
pub mod registers;
pub mod types;

pub use error::{ProtocolError, Result};
pub use geometry::{BYTES_PER_PIXEL, FieldGeometry};
pub use header::{HEADER_MARKER, HEADER_SIZE, MAX_SEQUENCE, PACKET_SIZE, PAYLOAD_SIZE, PacketHeader};
pub use registers::RegisterWrite;
pub use types::{FrameState, ScanType, TvInput, TvNorm};
