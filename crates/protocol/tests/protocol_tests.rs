//! Protocol Integration Tests
//!
//! Covers header decoding properties, field geometry for both norms and
//! every scan policy, and the register programs.
//!
//! Run with: `cargo test -p protocol`

use proptest::prelude::*;
use protocol::registers::{self, USBTV_BASE};
use protocol::{
    FieldGeometry, HEADER_SIZE, MAX_SEQUENCE, PACKET_SIZE, PAYLOAD_SIZE, PacketHeader,
    ProtocolError, ScanType, TvInput, TvNorm,
};

// ============================================================================
// Header Decoding
// ============================================================================

mod header_decoding {
    use super::*;

    proptest! {
        #[test]
        fn encoded_headers_decode_to_same_fields(
            frame_id in any::<u8>(),
            odd_field in any::<bool>(),
            sequence in 0u16..=MAX_SEQUENCE,
        ) {
            let header = PacketHeader { frame_id, odd_field, sequence };
            let mut packet = [0u8; PACKET_SIZE];
            header.write_to(&mut packet);
            prop_assert_eq!(PacketHeader::decode(&packet), Some(header));
        }

        #[test]
        fn wrong_marker_never_decodes(word in any::<u32>()) {
            prop_assume!(word >> 24 != 0x88);
            let bytes = word.to_be_bytes();
            prop_assert_eq!(
                PacketHeader::parse(&bytes),
                Err(ProtocolError::InvalidMarker { marker: (word >> 24) as u8 })
            );
        }

        #[test]
        fn reserved_bits_are_ignored(reserved in 0u32..8, sequence in 0u16..=MAX_SEQUENCE) {
            // bits 12..14 carry nothing we interpret
            let word = 0x8800_0000 | (reserved << 12) | sequence as u32;
            let header = PacketHeader::decode(&word.to_be_bytes()).unwrap();
            prop_assert_eq!(header.sequence, sequence);
            prop_assert!(!header.odd_field);
        }
    }

    #[test]
    fn test_all_zero_packet_is_noise() {
        let packet = [0u8; PACKET_SIZE];
        assert!(PacketHeader::decode(&packet).is_none());
    }

    #[test]
    fn test_payload_follows_header() {
        assert_eq!(HEADER_SIZE + PAYLOAD_SIZE, 964);
        assert!(HEADER_SIZE + PAYLOAD_SIZE <= PACKET_SIZE);
    }
}

// ============================================================================
// Field Geometry
// ============================================================================

mod field_geometry {
    use super::*;

    #[test]
    fn test_packets_per_field_by_norm() {
        for (norm, packets) in [(TvNorm::Ntsc, 360), (TvNorm::Pal, 432)] {
            for scan in [ScanType::Progressive, ScanType::Discard, ScanType::Interleaved] {
                let g = FieldGeometry::for_norm(norm, scan).unwrap();
                assert_eq!(g.packets_per_field, packets, "{norm} {scan}");
                assert_eq!(g.slot_bytes, 720 * norm.height() as usize * 2);
            }
        }
    }

    #[test]
    fn test_half_height_pictures_for_field_policies() {
        let progressive = FieldGeometry::for_norm(TvNorm::Pal, ScanType::Progressive).unwrap();
        let discard = FieldGeometry::for_norm(TvNorm::Pal, ScanType::Discard).unwrap();
        assert_eq!(progressive.picture_height, 288);
        assert_eq!(discard.picture_bytes, progressive.picture_bytes);
        assert_eq!(progressive.picture_bytes * 2, progressive.slot_bytes);
    }

    #[test]
    fn test_progressive_offsets_tile_the_field() {
        let g = FieldGeometry::for_norm(TvNorm::Ntsc, ScanType::Progressive).unwrap();
        let last = g.packets_per_field - 1;
        assert_eq!(g.progressive_offset(0), 0);
        assert_eq!(g.progressive_offset(last) + g.payload_size, g.picture_bytes);
    }

    proptest! {
        #[test]
        fn interleaved_offsets_are_disjoint_and_in_bounds(odd_field in any::<bool>()) {
            let g = FieldGeometry::for_norm(TvNorm::Ntsc, ScanType::Interleaved).unwrap();
            let mut covered = vec![false; g.slot_bytes / g.half_payload];
            for seq in 0..g.packets_per_field {
                for half in 0..2 {
                    let offset = g.interleaved_offset(seq, half, odd_field);
                    prop_assert!(offset + g.half_payload <= g.slot_bytes);
                    prop_assert_eq!(offset % g.half_payload, 0);
                    let unit = offset / g.half_payload;
                    prop_assert!(!covered[unit], "unit {} written twice", unit);
                    covered[unit] = true;
                }
            }
            // one field covers exactly half the picture
            prop_assert_eq!(covered.iter().filter(|c| **c).count() * 2, covered.len());
        }
    }

    #[test]
    fn test_odd_field_lands_on_even_lines() {
        let g = FieldGeometry::for_norm(TvNorm::Ntsc, ScanType::Interleaved).unwrap();
        for seq in [0u16, 1, 2, 100, 359] {
            for half in 0..2 {
                let odd_line = g.interleaved_offset(seq, half, true) / g.line_bytes;
                let even_line = g.interleaved_offset(seq, half, false) / g.line_bytes;
                assert_eq!(odd_line % 2, 0);
                assert_eq!(even_line, odd_line + 1);
            }
        }
    }

    #[test]
    fn test_too_many_packets_rejected() {
        // 8192 packets, twice what a 12-bit sequence can address
        let err = FieldGeometry::with_payload_size(2048, 8, ScanType::Progressive, 2).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidGeometry { .. }));
    }
}

// ============================================================================
// Register Programs
// ============================================================================

mod register_programs {
    use super::*;

    #[test]
    fn test_init_enables_device_first() {
        assert_eq!(registers::VIDEO_INIT[0], (USBTV_BASE + 0x0008, 0x0001));
    }

    #[test]
    fn test_input_programs_differ_only_where_expected() {
        let composite = registers::input_registers(TvInput::Composite);
        let svideo = registers::input_registers(TvInput::Svideo);
        assert_eq!(composite.len(), svideo.len());
        let differing = composite
            .iter()
            .zip(svideo)
            .filter(|(a, b)| a.1 != b.1)
            .count();
        assert_eq!(differing, 3);
    }

    #[test]
    fn test_norm_programs_selected_by_norm() {
        assert_eq!(registers::norm_registers(TvNorm::Ntsc), registers::NTSC_TV_NORM);
        assert_eq!(registers::norm_registers(TvNorm::Pal), registers::PAL_TV_NORM);
        assert_ne!(registers::NTSC_TV_NORM, registers::PAL_TV_NORM);
    }
}
