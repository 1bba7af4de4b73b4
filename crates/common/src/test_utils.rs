//! Test utilities for usbtv-capture
//!
//! Builders for protocol packets, whole fields and isochronous payloads,
//! shared by the unit, integration and bench code of every crate.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{field_packets, field_payload};
//!
//! let packets = field_packets(3, true, 4);
//! assert_eq!(packets.len(), 4);
//! assert_eq!(field_payload(3, true, 4).len(), 4 * protocol::PAYLOAD_SIZE);
//! ```

use protocol::{HEADER_SIZE, PACKET_SIZE, PAYLOAD_SIZE, PacketHeader};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Deterministic payload for one packet
///
/// The first two bytes carry the sequence number so a misplaced payload is
/// easy to spot in a failing assertion.
pub fn payload_pattern(frame_id: u8, odd_field: bool, sequence: u16) -> Vec<u8> {
    let seed = (frame_id as usize) * 31 + usize::from(odd_field) * 17 + sequence as usize;
    let mut payload: Vec<u8> = (0..PAYLOAD_SIZE).map(|i| ((seed + i) & 0xff) as u8).collect();
    payload[..2].copy_from_slice(&sequence.to_be_bytes());
    payload
}

/// Full 1024-byte protocol packet with header, payload and zero padding
pub fn build_packet(header: PacketHeader, payload: &[u8]) -> Vec<u8> {
    let mut packet = vec![0u8; PACKET_SIZE];
    header.write_to(&mut packet);
    let len = payload.len().min(PAYLOAD_SIZE);
    packet[HEADER_SIZE..HEADER_SIZE + len].copy_from_slice(&payload[..len]);
    packet
}

/// Packet for `(frame_id, odd_field, sequence)` carrying [`payload_pattern`]
pub fn pattern_packet(frame_id: u8, odd_field: bool, sequence: u16) -> Vec<u8> {
    let header = PacketHeader {
        frame_id,
        odd_field,
        sequence,
    };
    build_packet(header, &payload_pattern(frame_id, odd_field, sequence))
}

/// A packet whose marker byte is wrong
pub fn noise_packet() -> Vec<u8> {
    let mut packet = vec![0x5a; PACKET_SIZE];
    packet[0] = 0x00;
    packet
}

/// Every packet of one field, in sequence order
pub fn field_packets(frame_id: u8, odd_field: bool, packets_per_field: u16) -> Vec<Vec<u8>> {
    (0..packets_per_field)
        .map(|seq| pattern_packet(frame_id, odd_field, seq))
        .collect()
}

/// Concatenated payloads of a full field, i.e. its progressive picture
pub fn field_payload(frame_id: u8, odd_field: bool, packets_per_field: u16) -> Vec<u8> {
    (0..packets_per_field)
        .flat_map(|seq| payload_pattern(frame_id, odd_field, seq))
        .collect()
}

/// Group protocol packets into isochronous sub-packet payloads
pub fn iso_packets(packets: &[Vec<u8>], per_iso_packet: usize) -> Vec<Vec<u8>> {
    packets
        .chunks(per_iso_packet.max(1))
        .map(|chunk| chunk.concat())
        .collect()
}

/// `count` distinct sequence numbers below `total`, sorted, reproducible per seed
pub fn random_drops(total: u16, count: usize, seed: u64) -> Vec<u16> {
    let mut rng = StdRng::seed_from_u64(seed);
    let amount = count.min(total as usize);
    let mut drops: Vec<u16> = rand::seq::index::sample(&mut rng, total as usize, amount)
        .into_iter()
        .map(|i| i as u16)
        .collect();
    drops.sort_unstable();
    drops
}

/// Poll `condition` every few milliseconds until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}
