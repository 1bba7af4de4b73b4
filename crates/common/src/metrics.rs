//! Capture counters
//!
//! Every degraded condition on the streaming path (noise packets, lost
//! packets, full queue, exhausted pool, transient kernel errors) is absorbed
//! where it happens and only shows up here. Counters are plain atomics with
//! relaxed ordering; they are diagnostics, not synchronization.

use serde::Serialize;
use std::fmt;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Counters shared by the transport, the assembler and the session
#[derive(Debug)]
pub struct CaptureStats {
    packets_processed: AtomicU64,
    invalid_packets: AtomicU64,
    out_of_range_packets: AtomicU64,
    frames_emitted: AtomicU64,
    dropped_frames: AtomicU64,
    incomplete_frames: AtomicU64,
    pool_spins: AtomicU64,
    urbs_reaped: AtomicU64,
    bytes_received: AtomicU64,
    transient_errors: AtomicU64,
    stalls_cleared: AtomicU64,
    resubmit_failures: AtomicU64,
    started_at: RwLock<Option<Instant>>,
}

impl Default for CaptureStats {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureStats {
    pub fn new() -> Self {
        Self {
            packets_processed: AtomicU64::new(0),
            invalid_packets: AtomicU64::new(0),
            out_of_range_packets: AtomicU64::new(0),
            frames_emitted: AtomicU64::new(0),
            dropped_frames: AtomicU64::new(0),
            incomplete_frames: AtomicU64::new(0),
            pool_spins: AtomicU64::new(0),
            urbs_reaped: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            transient_errors: AtomicU64::new(0),
            stalls_cleared: AtomicU64::new(0),
            resubmit_failures: AtomicU64::new(0),
            started_at: RwLock::new(None),
        }
    }

    /// Mark the start of a streaming run
    pub fn mark_started(&self) {
        if let Ok(mut started_at) = self.started_at.write() {
            *started_at = Some(Instant::now());
        }
    }

    /// Time since [`CaptureStats::mark_started`]
    pub fn uptime(&self) -> Option<Duration> {
        self.started_at
            .read()
            .ok()
            .and_then(|started_at| started_at.map(|t| t.elapsed()))
    }

    #[inline]
    pub fn record_packet(&self) {
        self.packets_processed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_invalid_packet(&self) {
        self.invalid_packets.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_out_of_range(&self) {
        self.out_of_range_packets.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_frame_emitted(&self) {
        self.frames_emitted.fetch_add(1, Ordering::Relaxed);
    }

    /// A field abandoned mid-way, or a finished frame the queue had no room for
    #[inline]
    pub fn record_dropped_frame(&self) {
        self.dropped_frames.fetch_add(1, Ordering::Relaxed);
    }

    /// A field that reached its terminal packet with packets missing
    #[inline]
    pub fn record_incomplete_frame(&self) {
        self.incomplete_frames.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_pool_spin(&self) {
        self.pool_spins.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_urb_reaped(&self, bytes: u64) {
        self.urbs_reaped.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_transient_error(&self) {
        self.transient_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stall_cleared(&self) {
        self.stalls_cleared.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resubmit_failure(&self) {
        self.resubmit_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted.load(Ordering::Relaxed)
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    pub fn incomplete_frames(&self) -> u64 {
        self.incomplete_frames.load(Ordering::Relaxed)
    }

    pub fn pool_spins(&self) -> u64 {
        self.pool_spins.load(Ordering::Relaxed)
    }

    /// dropped / (emitted + dropped)
    pub fn drop_rate(&self) -> f64 {
        let emitted = self.frames_emitted();
        let dropped = self.dropped_frames();
        let total = emitted + dropped;
        if total == 0 {
            0.0
        } else {
            dropped as f64 / total as f64
        }
    }

    /// Reset all counters
    pub fn reset(&self) {
        for counter in [
            &self.packets_processed,
            &self.invalid_packets,
            &self.out_of_range_packets,
            &self.frames_emitted,
            &self.dropped_frames,
            &self.incomplete_frames,
            &self.pool_spins,
            &self.urbs_reaped,
            &self.bytes_received,
            &self.transient_errors,
            &self.stalls_cleared,
            &self.resubmit_failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        if let Ok(mut started_at) = self.started_at.write() {
            *started_at = None;
        }
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> StatsSnapshot {
        let uptime_secs = self.uptime().map(|d| d.as_secs_f64()).unwrap_or(0.0);
        let frames_emitted = self.frames_emitted();
        StatsSnapshot {
            packets_processed: self.packets_processed.load(Ordering::Relaxed),
            invalid_packets: self.invalid_packets.load(Ordering::Relaxed),
            out_of_range_packets: self.out_of_range_packets.load(Ordering::Relaxed),
            frames_emitted,
            dropped_frames: self.dropped_frames(),
            incomplete_frames: self.incomplete_frames(),
            pool_spins: self.pool_spins(),
            urbs_reaped: self.urbs_reaped.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            transient_errors: self.transient_errors.load(Ordering::Relaxed),
            stalls_cleared: self.stalls_cleared.load(Ordering::Relaxed),
            resubmit_failures: self.resubmit_failures.load(Ordering::Relaxed),
            drop_rate: self.drop_rate(),
            uptime_secs,
            frames_per_second: if uptime_secs > 0.0 {
                frames_emitted as f64 / uptime_secs
            } else {
                0.0
            },
        }
    }
}

/// Snapshot of the capture counters for display or serialization
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub packets_processed: u64,
    pub invalid_packets: u64,
    pub out_of_range_packets: u64,
    pub frames_emitted: u64,
    pub dropped_frames: u64,
    pub incomplete_frames: u64,
    pub pool_spins: u64,
    pub urbs_reaped: u64,
    pub bytes_received: u64,
    pub transient_errors: u64,
    pub stalls_cleared: u64,
    pub resubmit_failures: u64,
    pub drop_rate: f64,
    pub uptime_secs: f64,
    pub frames_per_second: f64,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} frames ({:.1} fps), {} dropped, {} incomplete, {} packets, {} invalid, {} pool spins",
            self.frames_emitted,
            self.frames_per_second,
            self.dropped_frames,
            self.incomplete_frames,
            self.packets_processed,
            self.invalid_packets,
            self.pool_spins
        )
    }
}
