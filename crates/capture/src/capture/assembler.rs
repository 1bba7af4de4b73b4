//! Packet-to-frame assembly
//!
//! Runs on the reap thread inside the isochronous callback, so nothing here
//! blocks or allocates: packets are decoded in place, copied into the active
//! pool slot, and finished frames are pushed on the output queue without
//! waiting.
//!
//! Field state machine, per packet:
//! 1. drop packets with a bad marker, and (discard policy) even-field packets
//! 2. drop packets whose sequence number is past the end of a field
//! 3. sequence 0 or a new frame id starts a new field; a field still in
//!    progress at that point is counted as dropped
//! 4. copy the payload to the scan policy's offset
//! 5. on the terminal sequence number, mark the field complete or partial
//!    and apply the policy's emission rule

use crate::capture::pool::{CapturedFrame, FrameLease, FramePool, OutputQueue};
use crate::usb::IsoTransfer;
use common::CaptureStats;
use protocol::header::payload;
use protocol::{FieldGeometry, FrameState, PACKET_SIZE, PacketHeader, ScanType};
use std::sync::Arc;
use tracing::{debug, trace};

/// Per-session field assembler
pub struct FrameAssembler {
    geometry: FieldGeometry,
    pool: Arc<FramePool>,
    queue: OutputQueue,
    stats: Arc<CaptureStats>,
    /// Slot being filled; `None` once the pool is stopping
    active: Option<FrameLease>,
    frame_id: Option<u8>,
    packets_done: u16,
    /// Interleaved: an odd field is written and waits for its even partner
    waiting_for_pair: bool,
    /// Interleaved: the waiting odd field was partial
    pair_partial: bool,
}

impl FrameAssembler {
    /// Create an assembler and claim its first working buffer
    pub fn new(pool: Arc<FramePool>, queue: OutputQueue, stats: Arc<CaptureStats>) -> Self {
        let geometry = *pool.geometry();
        let active = pool.acquire();
        Self {
            geometry,
            pool,
            queue,
            stats,
            active,
            frame_id: None,
            packets_done: 0,
            waiting_for_pair: false,
            pair_partial: false,
        }
    }

    pub fn geometry(&self) -> &FieldGeometry {
        &self.geometry
    }

    /// State of the slot being filled
    pub fn active_state(&self) -> Option<FrameState> {
        self.active.as_ref().map(FrameLease::state)
    }

    pub fn is_waiting_for_pair(&self) -> bool {
        self.waiting_for_pair
    }

    /// Feed every clean packet of a completed isochronous transfer
    pub fn on_iso_transfer(&mut self, transfer: &IsoTransfer<'_>) {
        for packet in transfer.packets() {
            if !packet.is_clean() {
                trace!("Skipping iso packet {} with status {}", packet.index, packet.status);
                continue;
            }
            for chunk in packet.data.chunks_exact(PACKET_SIZE) {
                self.process_packet(chunk);
            }
        }
    }

    /// Assemble one protocol packet
    pub fn process_packet(&mut self, packet: &[u8]) {
        let Some(header) = PacketHeader::decode(packet) else {
            self.stats.record_invalid_packet();
            return;
        };

        if self.geometry.scan == ScanType::Discard && !header.odd_field {
            return;
        }

        let packets_per_field = self.geometry.packets_per_field;
        if header.sequence >= packets_per_field {
            self.stats.record_out_of_range();
            trace!(
                "Sequence {} out of range (field has {} packets)",
                header.sequence, packets_per_field
            );
            return;
        }

        self.stats.record_packet();
        let Some(frame) = self.active.as_mut() else {
            return;
        };

        if header.sequence == 0 || self.frame_id != Some(header.frame_id) {
            if frame.state() == FrameState::InProgress {
                self.stats.record_dropped_frame();
                trace!(
                    "Field {:?} abandoned after {} packets",
                    self.frame_id, self.packets_done
                );
            }
            self.frame_id = Some(header.frame_id);
            self.packets_done = 0;
            frame.set_frame_id(header.frame_id);
            frame.set_state(FrameState::InProgress);
        }

        copy_payload(&self.geometry, frame, &header, payload(packet));
        self.packets_done = self.packets_done.saturating_add(1);

        if header.sequence == packets_per_field - 1 {
            self.finish_field(header.odd_field);
        }
    }

    fn finish_field(&mut self, odd_field: bool) {
        let partial = self.packets_done != self.geometry.packets_per_field;
        if partial {
            self.stats.record_incomplete_frame();
        }
        let state = if partial {
            FrameState::Partial
        } else {
            FrameState::Complete
        };
        if let Some(frame) = self.active.as_mut() {
            frame.set_state(state);
        }

        match self.geometry.scan {
            ScanType::Progressive => self.emit(),
            ScanType::Discard => {
                if odd_field {
                    self.emit();
                }
            }
            ScanType::Interleaved => {
                if self.waiting_for_pair {
                    if self.pair_partial
                        && let Some(frame) = self.active.as_mut()
                    {
                        frame.set_state(FrameState::Partial);
                    }
                    self.waiting_for_pair = false;
                    self.pair_partial = false;
                    self.emit();
                } else if odd_field {
                    self.waiting_for_pair = true;
                    self.pair_partial = partial;
                }
            }
        }
    }

    /// Push the active frame and move on to a fresh slot
    ///
    /// A full queue drops the frame and keeps filling the same slot.
    fn emit(&mut self) {
        let Some(lease) = self.active.take() else {
            return;
        };

        match self.queue.try_push(Some(CapturedFrame::new(lease))) {
            Ok(()) => {
                self.stats.record_frame_emitted();
                self.active = self.pool.acquire();
                if self.active.is_none() {
                    debug!("Frame pool stopping, assembler idle");
                }
            }
            Err(rejected) => {
                self.stats.record_dropped_frame();
                trace!("Output queue full, dropping frame {:?}", self.frame_id);
                if let Some(frame) = rejected.into_inner() {
                    let mut lease = frame.into_lease();
                    lease.set_state(FrameState::Start);
                    self.active = Some(lease);
                }
            }
        }
    }
}

fn copy_payload(geometry: &FieldGeometry, frame: &mut FrameLease, header: &PacketHeader, payload: &[u8]) {
    let payload = &payload[..payload.len().min(geometry.payload_size)];
    let data = frame.data_mut();

    match geometry.scan {
        ScanType::Progressive | ScanType::Discard => {
            let offset = geometry.progressive_offset(header.sequence);
            if let Some(dst) = data.get_mut(offset..offset + payload.len()) {
                dst.copy_from_slice(payload);
            }
        }
        ScanType::Interleaved => {
            for (half, src) in payload.chunks(geometry.half_payload).take(2).enumerate() {
                let offset = geometry.interleaved_offset(header.sequence, half, header.odd_field);
                if let Some(dst) = data.get_mut(offset..offset + src.len()) {
                    dst.copy_from_slice(src);
                }
            }
        }
    }
}

impl Drop for FrameAssembler {
    fn drop(&mut self) {
        // hand the slot back and wake a consumer parked on the queue
        self.active = None;
        let _ = self.queue.try_push(None);
    }
}

impl std::fmt::Debug for FrameAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameAssembler")
            .field("scan", &self.geometry.scan)
            .field("frame_id", &self.frame_id)
            .field("packets_done", &self.packets_done)
            .field("active", &self.active_state())
            .field("waiting_for_pair", &self.waiting_for_pair)
            .finish()
    }
}
