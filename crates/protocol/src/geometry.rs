//! Per-field geometry
//!
//! All the arithmetic that maps a packet's sequence number onto a destination
//! byte offset lives here so it can be checked without any USB in the loop.

use crate::error::{ProtocolError, Result};
use crate::header::{MAX_SEQUENCE, PAYLOAD_SIZE};
use crate::types::{ScanType, TvNorm};

/// YUYV: two bytes per pixel
pub const BYTES_PER_PIXEL: usize = 2;

/// Geometry of one capture configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldGeometry {
    /// Picture width in pixels
    pub width: u32,
    /// Full two-field height in lines
    pub height: u32,
    /// Scan policy the offsets are computed for
    pub scan: ScanType,
    /// Picture bytes per packet
    pub payload_size: usize,
    /// Packets that make up one field
    pub packets_per_field: u16,
    /// Bytes in one scan line
    pub line_bytes: usize,
    /// Half of a payload, the interleaved copy unit
    pub half_payload: usize,
    /// Half payloads per scan line (3 for 720 pixel lines)
    pub halves_per_line: usize,
    /// Bytes allocated per pool slot (width * height * 2)
    pub slot_bytes: usize,
    /// Bytes of a finished picture for this scan policy
    pub picture_bytes: usize,
    /// Lines of a finished picture for this scan policy
    pub picture_height: u32,
}

impl FieldGeometry {
    /// Geometry for a TV norm with the standard 960-byte payload
    pub fn for_norm(norm: TvNorm, scan: ScanType) -> Result<Self> {
        Self::new(norm.width(), norm.height(), scan)
    }

    /// Geometry for an arbitrary picture size with the standard payload
    pub fn new(width: u32, height: u32, scan: ScanType) -> Result<Self> {
        Self::with_payload_size(width, height, scan, PAYLOAD_SIZE)
    }

    /// Geometry with an explicit payload size
    ///
    /// # Errors
    ///
    /// Fails when the field cannot be carved into whole payloads, when the
    /// field needs more packets than the 12-bit sequence number can address,
    /// or (interleaved only) when a scan line is not a whole number of half
    /// payloads.
    pub fn with_payload_size(
        width: u32,
        height: u32,
        scan: ScanType,
        payload_size: usize,
    ) -> Result<Self> {
        let invalid = |reason| ProtocolError::InvalidGeometry {
            width,
            height,
            reason,
        };

        if width == 0 || height == 0 {
            return Err(invalid("dimensions must be non-zero"));
        }
        if height % 2 != 0 {
            return Err(invalid("height must hold two equal fields"));
        }
        if payload_size == 0 || payload_size % 2 != 0 {
            return Err(invalid("payload size must be even and non-zero"));
        }

        let line_bytes = width as usize * BYTES_PER_PIXEL;
        let field_bytes = line_bytes * (height as usize / 2);
        if field_bytes % payload_size != 0 {
            return Err(invalid("field size is not a whole number of payloads"));
        }

        let packets = field_bytes / payload_size;
        if packets > MAX_SEQUENCE as usize + 1 {
            return Err(invalid("field needs more packets than the sequence field allows"));
        }

        let half_payload = payload_size / 2;
        if scan == ScanType::Interleaved && line_bytes % half_payload != 0 {
            return Err(invalid("scan line is not a whole number of half payloads"));
        }

        let (picture_bytes, picture_height) = if scan.is_full_height() {
            (field_bytes * 2, height)
        } else {
            (field_bytes, height / 2)
        };

        Ok(Self {
            width,
            height,
            scan,
            payload_size,
            packets_per_field: packets as u16,
            line_bytes,
            half_payload,
            halves_per_line: line_bytes / half_payload,
            slot_bytes: field_bytes * 2,
            picture_bytes,
            picture_height,
        })
    }

    /// Byte offset of a packet's payload in a progressive picture
    #[inline]
    pub fn progressive_offset(&self, sequence: u16) -> usize {
        sequence as usize * self.payload_size
    }

    /// Byte offset of one half payload in an interleaved picture
    ///
    /// Half `half` (0 or 1) of packet `sequence` is part number
    /// `sequence * 2 + half`. Consecutive parts fill one field line, and field
    /// lines land on every other picture line: odd fields on even picture
    /// lines, even fields on odd picture lines.
    #[inline]
    pub fn interleaved_offset(&self, sequence: u16, half: usize, odd_field: bool) -> usize {
        let part = sequence as usize * 2 + half;
        let line = (part / self.halves_per_line) * 2 + usize::from(!odd_field);
        line * self.line_bytes + (part % self.halves_per_line) * self.half_payload
    }
}
