//! Frame assembly tests with full NTSC geometry
//!
//! Run with: `cargo test -p capture --test assembler_tests`

use capture::capture::{FrameAssembler, FramePool, OutputQueue, output_queue};
use capture::usb::IsoTransfer;
use common::CaptureStats;
use common::test_utils::{field_packets, field_payload, iso_packets, noise_packet, pattern_packet, random_drops};
use protocol::{FieldGeometry, FrameState, PACKET_SIZE, PAYLOAD_SIZE, ScanType, TvNorm};
use std::sync::Arc;

const NTSC_PACKETS: u16 = 360;
const LINE_BYTES: usize = 720 * 2;

struct Rig {
    assembler: FrameAssembler,
    queue: OutputQueue,
    pool: Arc<FramePool>,
    stats: Arc<CaptureStats>,
}

fn rig(scan: ScanType, pool_size: usize) -> Rig {
    let geometry = FieldGeometry::for_norm(TvNorm::Ntsc, scan).unwrap();
    let stats = Arc::new(CaptureStats::new());
    let pool = Arc::new(FramePool::new(pool_size, geometry, Arc::clone(&stats)));
    let queue = output_queue(pool.size());
    let assembler = FrameAssembler::new(Arc::clone(&pool), queue.clone(), Arc::clone(&stats));
    Rig {
        assembler,
        queue,
        pool,
        stats,
    }
}

fn feed(assembler: &mut FrameAssembler, packets: &[Vec<u8>]) {
    for packet in packets {
        assembler.process_packet(packet);
    }
}

// ============================================================================
// Progressive
// ============================================================================

mod progressive {
    use super::*;

    #[test]
    fn test_full_field_is_copied_verbatim() {
        let mut rig = rig(ScanType::Progressive, 4);
        feed(&mut rig.assembler, &field_packets(3, true, NTSC_PACKETS));

        let frame = rig.queue.try_pop().unwrap().unwrap();
        assert_eq!(frame.state(), FrameState::Complete);
        assert_eq!(frame.frame_id(), 3);
        assert_eq!((frame.width(), frame.height()), (720, 240));
        assert_eq!(frame.data(), field_payload(3, true, NTSC_PACKETS).as_slice());
        assert_eq!(rig.stats.snapshot().packets_processed, 360);
    }

    #[test]
    fn test_missing_packets_make_a_partial_frame() {
        let mut rig = rig(ScanType::Progressive, 4);
        // never drop the terminal packet, it is what finishes the field
        let drops = random_drops(NTSC_PACKETS - 1, 12, 7);
        let packets: Vec<Vec<u8>> = (0..NTSC_PACKETS)
            .filter(|seq| !drops.contains(seq))
            .map(|seq| pattern_packet(5, true, seq))
            .collect();
        feed(&mut rig.assembler, &packets);

        let frame = rig.queue.try_pop().unwrap().unwrap();
        assert_eq!(frame.state(), FrameState::Partial);
        assert_eq!(rig.stats.incomplete_frames(), 1);
        assert_eq!(rig.stats.dropped_frames(), 0);

        let expected = field_payload(5, true, NTSC_PACKETS);
        for seq in 0..NTSC_PACKETS as usize {
            let range = seq * PAYLOAD_SIZE..(seq + 1) * PAYLOAD_SIZE;
            if drops.contains(&(seq as u16)) {
                // fresh slots start zeroed and missing packets are not filled
                assert!(frame.data()[range].iter().all(|&b| b == 0), "seq {}", seq);
            } else {
                assert_eq!(frame.data()[range.clone()], expected[range], "seq {}", seq);
            }
        }
    }

    #[test]
    fn test_duplicate_packet_masks_a_missing_one() {
        let mut rig = rig(ScanType::Progressive, 4);
        // sequence 99 arrives twice and 100 never does; the count still adds up
        let packets: Vec<Vec<u8>> = (0..NTSC_PACKETS)
            .map(|seq| if seq == 100 { 99 } else { seq })
            .map(|seq| pattern_packet(5, true, seq))
            .collect();
        feed(&mut rig.assembler, &packets);

        let frame = rig.queue.try_pop().unwrap().unwrap();
        assert_eq!(frame.state(), FrameState::Complete);
        assert_eq!(rig.stats.incomplete_frames(), 0);
        let missing = 100 * PAYLOAD_SIZE..101 * PAYLOAD_SIZE;
        assert!(frame.data()[missing].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_unfinished_field_is_dropped_by_the_next() {
        let mut rig = rig(ScanType::Progressive, 4);
        let mut first = field_packets(1, true, NTSC_PACKETS);
        first.pop();
        feed(&mut rig.assembler, &first);
        feed(&mut rig.assembler, &field_packets(2, false, NTSC_PACKETS));

        assert_eq!(rig.queue.len(), 1);
        assert_eq!(rig.stats.dropped_frames(), 1);
        let frame = rig.queue.try_pop().unwrap().unwrap();
        assert_eq!(frame.frame_id(), 2);
        assert!(frame.is_complete());
    }

    #[test]
    fn test_frame_id_change_mid_field_restarts() {
        let mut rig = rig(ScanType::Progressive, 4);
        feed(&mut rig.assembler, &field_packets(1, true, 100));
        // id 2 picks up mid-field without a sequence 0
        let rest: Vec<Vec<u8>> = (100..NTSC_PACKETS).map(|seq| pattern_packet(2, true, seq)).collect();
        feed(&mut rig.assembler, &rest);

        assert_eq!(rig.stats.dropped_frames(), 1);
        let frame = rig.queue.try_pop().unwrap().unwrap();
        assert_eq!(frame.frame_id(), 2);
        assert_eq!(frame.state(), FrameState::Partial);
    }

    #[test]
    fn test_noise_and_out_of_range_do_not_disturb_a_field() {
        let mut rig = rig(ScanType::Progressive, 4);
        let mut packets = field_packets(4, true, NTSC_PACKETS);
        packets.insert(10, noise_packet());
        packets.insert(20, pattern_packet(9, false, NTSC_PACKETS));
        packets.insert(30, pattern_packet(9, false, 4000));
        feed(&mut rig.assembler, &packets);

        let snapshot = rig.stats.snapshot();
        assert_eq!(snapshot.invalid_packets, 1);
        assert_eq!(snapshot.out_of_range_packets, 2);
        assert_eq!(snapshot.dropped_frames, 0);
        let frame = rig.queue.try_pop().unwrap().unwrap();
        assert!(frame.is_complete());
        assert_eq!(frame.data(), field_payload(4, true, NTSC_PACKETS).as_slice());
    }
}

// ============================================================================
// Discard and Interleaved
// ============================================================================

mod field_policies {
    use super::*;

    #[test]
    fn test_discard_emits_only_odd_fields() {
        let mut rig = rig(ScanType::Discard, 4);
        for id in 0..4u8 {
            feed(&mut rig.assembler, &field_packets(id, id % 2 == 1, NTSC_PACKETS));
        }
        assert_eq!(rig.queue.len(), 2);
        while let Some(Some(frame)) = rig.queue.try_pop() {
            assert_eq!(frame.frame_id() % 2, 1);
            assert!(frame.is_complete());
        }
        // even-field packets are not counted as processed
        assert_eq!(rig.stats.snapshot().packets_processed, 2 * 360);
    }

    #[test]
    fn test_interleaved_weaves_lines() {
        let mut rig = rig(ScanType::Interleaved, 4);
        feed(&mut rig.assembler, &field_packets(6, true, NTSC_PACKETS));
        assert!(rig.queue.is_empty());
        feed(&mut rig.assembler, &field_packets(6, false, NTSC_PACKETS));

        let frame = rig.queue.try_pop().unwrap().unwrap();
        assert!(frame.is_complete());
        assert_eq!(frame.height(), 480);
        assert_eq!(frame.data().len(), 720 * 480 * 2);

        let odd = field_payload(6, true, NTSC_PACKETS);
        let even = field_payload(6, false, NTSC_PACKETS);
        for (row, line) in frame.data().chunks_exact(LINE_BYTES).enumerate() {
            let field_line = row / 2;
            let source = if row % 2 == 0 { &odd } else { &even };
            assert_eq!(
                line,
                &source[field_line * LINE_BYTES..(field_line + 1) * LINE_BYTES],
                "row {}",
                row
            );
        }
    }

    #[test]
    fn test_interleaved_ignores_lone_even_field() {
        let mut rig = rig(ScanType::Interleaved, 4);
        feed(&mut rig.assembler, &field_packets(1, false, NTSC_PACKETS));
        assert!(rig.queue.is_empty());
        assert!(!rig.assembler.is_waiting_for_pair());
    }
}

// ============================================================================
// Pool and Queue Pressure
// ============================================================================

mod pressure {
    use super::*;

    #[test]
    fn test_slow_consumer_drops_frames_without_leaking_slots() {
        let mut rig = rig(ScanType::Progressive, 3);
        for id in 0..6u8 {
            feed(&mut rig.assembler, &field_packets(id, true, NTSC_PACKETS));
        }
        // queue holds pool_size - 1 frames, the rest were dropped in place
        assert_eq!(rig.queue.len(), 2);
        assert_eq!(rig.stats.frames_emitted(), 2);
        assert_eq!(rig.stats.dropped_frames(), 4);
        assert_eq!(rig.pool.locked_count(), 3);

        let drained = rig.queue.drain().flatten().count();
        assert_eq!(drained, 2);
        assert_eq!(rig.pool.locked_count(), 1);
        drop(rig.assembler);
        assert_eq!(rig.pool.locked_count(), 0);
    }

    #[test]
    fn test_consumed_frames_are_reused() {
        let mut rig = rig(ScanType::Progressive, 2);
        for id in 0..10u8 {
            feed(&mut rig.assembler, &field_packets(id, true, NTSC_PACKETS));
            let frame = rig.queue.try_pop().unwrap().unwrap();
            assert_eq!(frame.frame_id(), id);
            frame.release();
        }
        assert_eq!(rig.stats.frames_emitted(), 10);
        assert_eq!(rig.stats.dropped_frames(), 0);
    }
}

// ============================================================================
// Isochronous Delivery
// ============================================================================

mod iso_delivery {
    use super::*;

    fn iso_transfer_buffer(packets: &[Vec<u8>], per_iso: usize) -> (Vec<u8>, Vec<(u32, u32, u32)>) {
        let slot = per_iso * PACKET_SIZE;
        let mut buffer = Vec::new();
        let mut descriptors = Vec::new();
        for chunk in iso_packets(packets, per_iso) {
            let mut data = chunk.clone();
            data.resize(slot, 0);
            buffer.extend_from_slice(&data);
            descriptors.push((slot as u32, chunk.len() as u32, 0));
        }
        (buffer, descriptors)
    }

    #[test]
    fn test_multi_packet_iso_payloads_are_split() {
        let mut rig = rig(ScanType::Progressive, 4);
        let packets = field_packets(8, true, NTSC_PACKETS);
        let (buffer, descriptors) = iso_transfer_buffer(&packets, 3);

        let descriptors: Vec<capture::usb::usbfs::IsoPacketDesc> = descriptors
            .into_iter()
            .map(|(length, actual_length, status)| capture::usb::usbfs::IsoPacketDesc {
                length,
                actual_length,
                status,
            })
            .collect();
        let transfer = IsoTransfer::new(0x81, 0, &buffer, &descriptors);
        rig.assembler.on_iso_transfer(&transfer);

        let frame = rig.queue.try_pop().unwrap().unwrap();
        assert!(frame.is_complete());
        assert_eq!(frame.data(), field_payload(8, true, NTSC_PACKETS).as_slice());
    }

    #[test]
    fn test_errored_iso_packets_are_skipped() {
        let mut rig = rig(ScanType::Progressive, 4);
        let packets = field_packets(8, true, NTSC_PACKETS);
        let (buffer, descriptors) = iso_transfer_buffer(&packets, 3);

        let descriptors: Vec<capture::usb::usbfs::IsoPacketDesc> = descriptors
            .into_iter()
            .enumerate()
            .map(|(i, (length, actual_length, _))| capture::usb::usbfs::IsoPacketDesc {
                length,
                actual_length,
                // -EPROTO on the second iso packet
                status: if i == 1 { (-71i32) as u32 } else { 0 },
            })
            .collect();
        let transfer = IsoTransfer::new(0x81, 0, &buffer, &descriptors);
        rig.assembler.on_iso_transfer(&transfer);

        let frame = rig.queue.try_pop().unwrap().unwrap();
        assert_eq!(frame.state(), FrameState::Partial);
        assert_eq!(rig.stats.snapshot().packets_processed, 357);
    }
}
