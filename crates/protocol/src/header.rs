//! Video packet header decoding
//!
//! Every isochronous sub-packet delivered by the capture chip is cut into
//! fixed-size protocol packets. Each one starts with a 4-byte big-endian word:
//!
//! ```text
//!  31      24 23      16 15 14  12 11             0
//! +----------+----------+--+------+----------------+
//! |  0x88    | frame id |O | rsvd |    sequence    |
//! +----------+----------+--+------+----------------+
//! ```
//!
//! followed by [`PAYLOAD_SIZE`] bytes of YUYV picture data and padding up to
//! [`PACKET_SIZE`]. A packet whose marker byte is not `0x88` is line noise and
//! is dropped by the caller without any further bookkeeping.

use crate::error::{ProtocolError, Result};
use byteorder::{BigEndian, ByteOrder};

/// Size of one protocol packet inside an isochronous sub-packet
pub const PACKET_SIZE: usize = 1024;

/// Size of the big-endian header word
pub const HEADER_SIZE: usize = 4;

/// Picture bytes carried by one packet
pub const PAYLOAD_SIZE: usize = 960;

/// Required value of the header's top byte
pub const HEADER_MARKER: u8 = 0x88;

const FRAME_ID_SHIFT: u32 = 16;
const FRAME_ID_MASK: u32 = 0x00ff_0000;
const ODD_FIELD_BIT: u32 = 1 << 15;
const SEQUENCE_MASK: u32 = 0x0000_0fff;

/// Largest sequence number the 12-bit field can carry
pub const MAX_SEQUENCE: u16 = SEQUENCE_MASK as u16;

/// Decoded packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketHeader {
    /// Frame id shared by all packets of one field
    pub frame_id: u8,
    /// True for the odd (top) field
    pub odd_field: bool,
    /// 0-based packet index within the field
    pub sequence: u16,
}

impl PacketHeader {
    /// Parse the header at the start of `packet`
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::BufferTooSmall`] when fewer than four bytes are
    /// available and [`ProtocolError::InvalidMarker`] when the marker byte is wrong.
    pub fn parse(packet: &[u8]) -> Result<Self> {
        if packet.len() < HEADER_SIZE {
            return Err(ProtocolError::BufferTooSmall {
                needed: HEADER_SIZE,
                available: packet.len(),
            });
        }

        let word = BigEndian::read_u32(&packet[..HEADER_SIZE]);
        let marker = (word >> 24) as u8;
        if marker != HEADER_MARKER {
            return Err(ProtocolError::InvalidMarker { marker });
        }

        Ok(Self::from_word(word))
    }

    /// Hot-path variant of [`PacketHeader::parse`] that just reports validity
    #[inline]
    pub fn decode(packet: &[u8]) -> Option<Self> {
        Self::parse(packet).ok()
    }

    #[inline]
    fn from_word(word: u32) -> Self {
        Self {
            frame_id: ((word & FRAME_ID_MASK) >> FRAME_ID_SHIFT) as u8,
            odd_field: word & ODD_FIELD_BIT != 0,
            sequence: (word & SEQUENCE_MASK) as u16,
        }
    }

    /// Header as the raw 32-bit word, marker included
    pub fn to_word(&self) -> u32 {
        let mut word = (HEADER_MARKER as u32) << 24;
        word |= (self.frame_id as u32) << FRAME_ID_SHIFT;
        if self.odd_field {
            word |= ODD_FIELD_BIT;
        }
        word | (self.sequence as u32 & SEQUENCE_MASK)
    }

    /// Write the header into the first four bytes of `packet`
    ///
    /// # Panics
    ///
    /// Panics if `packet` is shorter than [`HEADER_SIZE`].
    pub fn write_to(&self, packet: &mut [u8]) {
        BigEndian::write_u32(&mut packet[..HEADER_SIZE], self.to_word());
    }
}

/// Payload bytes of a packet, clamped to what is actually present
#[inline]
pub fn payload(packet: &[u8]) -> &[u8] {
    let end = packet.len().min(HEADER_SIZE + PAYLOAD_SIZE);
    packet.get(HEADER_SIZE..end).unwrap_or(&[])
}
